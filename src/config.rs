use clap::Parser;
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(name = "minivault", version, about = "Local REST façade over an Ollama runtime")]
pub struct Config {
    #[arg(long, env, default_value = "0.0.0.0:8000")]
    pub bind_addr: String,
    #[arg(long, env, default_value = "http://localhost:11434")]
    pub ollama_base_url: String,
    #[arg(long, env, default_value = "llama2")]
    pub ollama_model: String,
    #[arg(long, env, default_value_t = 30)]
    pub request_timeout_secs: u64,
    #[arg(long, env, default_value_t = 5)]
    pub probe_timeout_secs: u64,
    #[arg(long, env, default_value = "logs/log.jsonl")]
    pub log_file: PathBuf,
}

impl Config {
    pub fn base_url(&self) -> &str {
        self.ollama_base_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
