use clap::Parser;
use dataset_csi::NodeServer;
use dataset_csi::cli::{Args, Command};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.driver_config().map_err(anyhow::Error::msg)?;
    let node = NodeServer::from_config(&config);

    let run = async {
        match args.command {
            Command::Stage {
                volume_id,
                staging_path,
                params,
            } => {
                node.stage(Command::stage_request(volume_id, staging_path, params))
                    .await?
            }
            Command::Unstage {
                volume_id,
                staging_path,
            } => {
                node.unstage(Command::unstage_request(volume_id, staging_path))
                    .await?
            }
            Command::Publish {
                volume_id,
                staging_path,
                target_path,
                params,
            } => {
                node.publish(Command::publish_request(
                    volume_id,
                    staging_path,
                    target_path,
                    params,
                ))
                .await?
            }
            Command::Unpublish {
                volume_id,
                target_path,
            } => {
                node.unpublish(Command::unpublish_request(volume_id, target_path))
                    .await?
            }
            Command::Info => {
                let info = serde_json::json!({
                    "driver": config.name,
                    "version": config.version,
                    "node": node.node_info(),
                    "capabilities": node.capabilities(),
                });
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
        }
        anyhow::Ok(())
    };

    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            warn!("interrupted, canceling running builds");
            node.shutdown();
            // the build cleans up its temp files before reporting
            run.await
        }
    };
    result?;
    info!("done");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
