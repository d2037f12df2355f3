mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Command, KeygenArgs, RevokeArgs, RunArgs};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Command::Run(RunArgs::default()));

    match command {
        Command::Run(args) => cmd_run(args),
        Command::Keygen(args) => cmd_keygen(args),
        Command::Revoke(args) => cmd_revoke(args),
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let _guard = init_logging(&args.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let application = app::Application::build(args.listen_addr).await?;
        application.serve().await
    })
}

fn cmd_keygen(args: KeygenArgs) -> anyhow::Result<()> {
    let role: veil_core::Role = args
        .role
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let keys = key_store().await;
        let (plaintext, record) = keys.generate(role, &args.label).await;
        println!("key:  {plaintext}");
        println!("id:   {}", record.id);
        println!("role: {}", record.role);
        println!("The key is shown once; only its hash is stored.");
        Ok(())
    })
}

fn cmd_revoke(args: RevokeArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let keys = key_store().await;
        let revoked = if args.key.starts_with(veil_core::keys::KEY_PREFIX) {
            keys.revoke(&args.key).await
        } else {
            keys.revoke_by_id(&args.key).await
        };
        if revoked {
            println!("Revoked.");
            Ok(())
        } else {
            anyhow::bail!("no such key")
        }
    })
}

async fn key_store() -> veil_core::keys::ApiKeyStore {
    let addr = std::env::var("REDIS_ADDR").ok();
    let password = std::env::var("REDIS_PASSWORD").ok();
    let kv = veil_core::kv::KvStore::connect(addr.as_deref(), password.as_deref()).await;
    veil_core::keys::ApiKeyStore::new(std::sync::Arc::new(kv))
}

/// Stderr logging by default; daily-rotated files when VEIL_LOG_DIR is set.
/// The returned guard must live for the process lifetime.
fn init_logging(level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match std::env::var("VEIL_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let file_appender = tracing_appender::rolling::daily(dir, "veil.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();

            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}
