use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facemem_core::persist::Artifacts;
use facemem_core::{default_data_dir, FilePersistence, Persistence};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facemem", about = "facemem face memory CLI")]
struct Cli {
    /// Base URL of a running facememd
    #[arg(long, env = "FACEMEM_URL", default_value = "http://127.0.0.1:8001", global = true)]
    url: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remember the main face in an image under a label
    Add {
        /// Name to store with the face (e.g., "Ada")
        #[arg(short, long)]
        label: String,
        /// JPEG or PNG photo
        image: PathBuf,
    },
    /// Name every enrolled face found in an image
    Recognize {
        image: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Read the store files directly, without the daemon
    Inspect {
        /// Directory holding face_embeddings.bin and labels.json
        #[arg(long, env = "FACEMEM_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Add { label, image } => {
            let body = json!({ "image_base64": read_image_base64(&image)?, "comment": label });
            let reply = post(&client, &format!("{base}/add"), &body).await?;
            println!("{}", reply["result"].as_str().unwrap_or("enrolled"));
        }
        Commands::Recognize { image } => {
            let body = json!({ "image_base64": read_image_base64(&image)? });
            let reply = post(&client, &format!("{base}/recognize"), &body).await?;
            for line in describe_recognition(&reply) {
                println!("{line}");
            }
        }
        Commands::Status => {
            let response = client
                .get(format!("{base}/status"))
                .send()
                .await
                .with_context(|| format!("facememd not reachable at {base}"))?;
            let status: Value = response.error_for_status()?.json().await?;
            println!("facememd {}", status["version"].as_str().unwrap_or("?"));
            println!("  records:    {}", status["records"]);
            println!("  consistent: {}", status["consistent"]);
            println!("  thresholds: {}", status["thresholds"]);
        }
        Commands::Inspect { data_dir } => {
            let dir = data_dir.unwrap_or_else(default_data_dir);
            tracing::debug!(dir = %dir.display(), "inspecting store");
            let artifacts = FilePersistence::in_dir(&dir)
                .load()
                .with_context(|| format!("reading store in {}", dir.display()))?;
            for line in describe_artifacts(&artifacts) {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn read_image_base64(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(facemem_core::codec::encode_base64(&bytes))
}

/// POST a JSON body and turn the daemon's `{"error", "message"}` replies into errors.
async fn post(client: &reqwest::Client, url: &str, body: &Value) -> Result<Value> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("facememd not reachable at {url}"))?;

    let status = response.status();
    let reply: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let code = reply["error"].as_str().unwrap_or("http_error");
        let message = reply["message"].as_str().unwrap_or_else(|| status.as_str());
        bail!("{code}: {message}");
    }
    Ok(reply)
}

fn describe_recognition(reply: &Value) -> Vec<String> {
    let faces = reply["faces"].as_array().map(Vec::as_slice).unwrap_or_default();
    match reply["status"].as_str() {
        Some("empty_database") => vec!["No faces enrolled yet".to_string()],
        Some("no_faces") => vec!["No faces found in the image".to_string()],
        _ if faces.is_empty() => vec![format!(
            "{} face(s) detected, none recognized",
            reply["faces_detected"]
        )],
        _ => faces
            .iter()
            .map(|face| {
                format!(
                    "{} ({:.1}%)",
                    face["name"].as_str().unwrap_or("?"),
                    face["confidence"].as_f64().unwrap_or(0.0)
                )
            })
            .collect(),
    }
}

fn describe_artifacts(artifacts: &Artifacts) -> Vec<String> {
    let rows = artifacts.embeddings.as_ref().map(Vec::len);
    let labels = artifacts.labels.as_deref().unwrap_or_default();
    let mut lines = vec![
        match rows {
            Some(n) => format!("embeddings: {n}"),
            None => "embeddings: missing".to_string(),
        },
        match &artifacts.labels {
            Some(l) => format!("labels:     {}", l.len()),
            None => "labels:     missing".to_string(),
        },
    ];

    let rows = rows.unwrap_or(0);
    if rows != labels.len() {
        lines.push(format!(
            "MISMATCH: next enrollment truncates both to {}",
            rows.min(labels.len())
        ));
    }
    lines.extend(labels.iter().enumerate().map(|(i, label)| format!("  [{i}] {label}")));
    lines
}
