use std::time::{Duration, Instant};
use rand::{seq::SliceRandom, thread_rng};
use reqwest::Client;
use hdrhistogram::Histogram;
use serde_json::Value;


fn flag(args: &[String], name: &str, default: usize) -> anyhow::Result<usize> {
    match args.iter().position(|a| a == name) {
        Some(i) => Ok(args.get(i + 1).ok_or_else(|| anyhow::anyhow!("{name} needs a value"))?.parse()?),
        None => Ok(default),
    }
}

/// Requests client `i` of `clients` runs so that all `total` are issued.
fn share(total: usize, clients: usize, i: usize) -> usize {
    total / clients + usize::from(i < total % clients)
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let base = args
        .first()
        .filter(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
    let base = base.trim_end_matches('/').to_string();
    let total = flag(&args, "--requests", 40)?;
    let clients = flag(&args, "--concurrency", 4)?.max(1);
    let prompts = vec![
        "Hello, how are you?",
        "What is the capital of France?",
        "Explain quantum computing in simple terms",
        "Why is the sky blue?",
        "Write a haiku about the sea",
    ];

    let client = Client::builder().pool_idle_timeout(Duration::from_secs(10)).build()?;

    let health: Value = client.get(format!("{base}/health")).send().await?.error_for_status()?.json().await?;
    println!("health: {} (ollama {})", health["status"], health["ollama_status"]);
    if let Some(models) = health["available_models"].as_array() {
        println!("models: {}", models.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", "));
    }

    let url = format!("{base}/generate");
    let mut hist = Histogram::<u64>::new(3)?;
    let mut errors = 0usize;
    let mut fallbacks = 0usize;

    let start = Instant::now();
    let mut tasks = vec![];
    for i in 0..clients {
        let n = share(total, clients, i);
        let client = client.clone();
        let url = url.clone();
        let prompts = prompts.clone();
        tasks.push(tokio::spawn(async move {
            let mut latencies = vec![];
            let (mut errs, mut fell_back) = (0, 0);
            for _ in 0..n {
                let p = {
                    let mut rng = thread_rng();
                    prompts.choose(&mut rng).unwrap().to_string()
                };
                let t0 = Instant::now();
                let res = client.post(&url).json(&serde_json::json!({"prompt": p})).send().await;
                let dur = t0.elapsed();
                match res {
                    Ok(r) if r.status().is_success() => {
                        latencies.push(dur);
                        if let Ok(body) = r.json::<Value>().await {
                            if body["model"].as_str().is_some_and(|m| m.ends_with("(fallback)")) {
                                fell_back += 1;
                            }
                        }
                    }
                    _ => errs += 1,
                }
            }
            (latencies, errs, fell_back)
        }));
    }

    for t in tasks {
        let (ls, e, f) = t.await?;
        for d in ls { hist.record(d.as_millis() as u64).ok(); }
        errors += e;
        fallbacks += f;
    }

    println!("ran {} reqs in {:?}", total, start.elapsed());
    println!("errors: {}", errors);
    println!("fallback responses: {}", fallbacks);
    println!("p50: {} ms", hist.value_at_quantile(0.50));
    println!("p95: {} ms", hist.value_at_quantile(0.95));
    println!("p99: {} ms", hist.value_at_quantile(0.99));

    let stats: Value = client.get(format!("{base}/logs/stats")).send().await?.error_for_status()?.json().await?;
    println!("log stats: {stats}");
    Ok(())
}
