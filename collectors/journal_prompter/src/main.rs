use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::{sleep, Duration},
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "journal_prompter", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17700
    #[arg(long, default_value = "http://127.0.0.1:17700")]
    core_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Switch the active category.
    Category { name: String },
    /// Save a note against the active category.
    Note {
        text: String,
        #[arg(long)]
        subcategory: Option<String>,
    },
    /// Record a shift event: work_in, lunch_out, lunch_in or work_out.
    Shift { kind: String },
    /// Flush pending time now.
    Tick,
    /// Flush, write the shutdown marker and stop the core.
    Shutdown,
    /// Print today's report.
    Report {
        /// json, markdown or csv.
        #[arg(long, default_value = "markdown")]
        format: String,
    },
    /// Poll notifications and answer note prompts from stdin.
    Watch {
        /// Poll interval (milliseconds).
        #[arg(long, default_value_t = 2000)]
        poll_ms: u64,
    },
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

fn open_envelope<T>(body: Envelope<T>) -> anyhow::Result<Option<T>> {
    if body.ok {
        return Ok(body.data);
    }
    let code = body.error.unwrap_or_else(|| "not_ok".to_string());
    match body.detail {
        Some(detail) => anyhow::bail!("{code}: {detail}"),
        None => anyhow::bail!("{code}"),
    }
}

fn endpoint(core_url: &str, path: &str) -> String {
    format!("{}/{}", core_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn get_ok<T: DeserializeOwned>(client: &Client, url: &str) -> anyhow::Result<Option<T>> {
    let res = client.get(url).send().await?;
    let body: Envelope<T> = res.json().await?;
    open_envelope(body)
}

async fn post_ok<B: Serialize, T: DeserializeOwned>(
    client: &Client,
    url: &str,
    payload: &B,
) -> anyhow::Result<Option<T>> {
    let res = client.post(url).json(payload).send().await?;
    let body: Envelope<T> = res.json().await?;
    open_envelope(body)
}

fn print_data(data: Option<Value>) -> anyhow::Result<()> {
    if let Some(v) = data {
        println!("{}", serde_json::to_string_pretty(&v)?);
    }
    Ok(())
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Notification {
    PromptForNote,
    NoteSaved {
        category: String,
        timestamp: String,
    },
    IllegalShiftTransition {
        shift: String,
        state: String,
        reason: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journal_prompter=info".into()),
        )
        .init();

    let args = Args::parse();
    let client = Client::new();
    let url = |path: &str| endpoint(&args.core_url, path);

    match args.command {
        Command::Category { ref name } => {
            let data: Option<Value> =
                post_ok(&client, &url("category"), &serde_json::json!({ "category": name })).await?;
            print_data(data)?;
        }
        Command::Note {
            ref text,
            ref subcategory,
        } => {
            let data: Option<Value> = post_ok(
                &client,
                &url("note"),
                &serde_json::json!({ "text": text, "subcategory": subcategory }),
            )
            .await?;
            print_data(data)?;
        }
        Command::Shift { ref kind } => {
            let data: Option<Value> =
                post_ok(&client, &url("shift"), &serde_json::json!({ "kind": kind })).await?;
            print_data(data)?;
        }
        Command::Tick => {
            let data: Option<Value> = post_ok(&client, &url("tick"), &Value::Null).await?;
            print_data(data)?;
        }
        Command::Shutdown => {
            let _: Option<Value> = post_ok(&client, &url("shutdown"), &Value::Null).await?;
            info!("core shut down");
        }
        Command::Report { ref format } => {
            let res = client
                .get(url("report"))
                .query(&[("format", format.as_str())])
                .send()
                .await?;
            if format == "json" {
                let body: Envelope<Value> = res.json().await?;
                print_data(open_envelope(body)?)?;
            } else {
                if !res.status().is_success() {
                    anyhow::bail!("http_{}", res.status().as_u16());
                }
                print!("{}", res.text().await?);
            }
        }
        Command::Watch { poll_ms } => watch(&client, &args.core_url, poll_ms).await?,
    }
    Ok(())
}

async fn watch(client: &Client, core_url: &str, poll_ms: u64) -> anyhow::Result<()> {
    let notifications_url = endpoint(core_url, "notifications");
    let note_url = endpoint(core_url, "note");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    info!("watching {notifications_url}");
    loop {
        let pending: Vec<Notification> = match get_ok(client, &notifications_url).await {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                warn!("poll failed: {e}");
                sleep(Duration::from_millis(poll_ms)).await;
                continue;
            }
        };

        for n in pending {
            match n {
                Notification::PromptForNote => {
                    println!(
                        "[{}] What are you working on? (empty line to skip)",
                        chrono::Local::now().format("%H:%M")
                    );
                    let Some(line) = stdin.next_line().await? else {
                        info!("stdin closed; stopping");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let res: anyhow::Result<Option<Value>> =
                        post_ok(client, &note_url, &serde_json::json!({ "text": line })).await;
                    if let Err(e) = res {
                        warn!("note not saved: {e}");
                    }
                }
                Notification::NoteSaved {
                    category,
                    timestamp,
                } => println!("saved note for {category} at {timestamp}"),
                Notification::IllegalShiftTransition {
                    shift,
                    state,
                    reason,
                } => println!("cannot {shift} while {state}: {reason}"),
            }
        }
        sleep(Duration::from_millis(poll_ms)).await;
    }
}
