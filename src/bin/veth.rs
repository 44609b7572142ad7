use anyhow::Result;
use podlink::commands::{run_cni, PluginKind};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    // stdout carries the result, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run_cni(PluginKind::Veth) {
        let verb = std::env::var("CNI_COMMAND").unwrap_or_else(|_| "CNI".to_string());
        eprintln!("{}: {}", verb, err);
        std::process::exit(1);
    }

    Ok(())
}
