use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use signalling_service::{Request, Response, SignallingService};

#[derive(Parser, Debug)]
#[command(name = "signallingd")]
#[command(about = "Signalling Service Daemon")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ログ設定
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting signalling daemon");

    let mut service = SignallingService::new();

    // 1 行 1 リクエストの JSON を stdin から読み、1 行 1 レスポンスを
    // stdout に返す。ここが UI/IPC ブリッジとの境界になる
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => service.handle_request(request).await,
            Err(e) => {
                warn!("invalid request: {e}");
                Response::err(format!("invalid request: {e}"))
            }
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    // stdin が閉じたら全クライアントを畳んで終了する
    service.destroy().await;
    info!("Signalling daemon stopped");
    Ok(())
}
