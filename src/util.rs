use std::{fs, path::Path};


/// Creates the parent directory of `p` if needed. Returns `true` when something was created.
pub fn ensure_parent_dir<P: AsRef<Path>>(p: P) -> std::io::Result<bool> {
match p.as_ref().parent() {
Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => { fs::create_dir_all(dir)?; Ok(true) }
_ => Ok(false),
}
}
