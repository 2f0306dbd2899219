use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;

use ferret::data::{JsonFileStore, Ledger};

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    /// Serve the lookup API and the Telegram webhook.
    Server,

    /// Point Telegram at this deployment's webhook URL.
    SetWebhook { url: reqwest::Url },

    /// Create a gift code in the ledger, replacing any previous use count.
    GiftCode {
        code: String,
        #[clap(default_value_t = 1)]
        uses: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    ferret::tracing::init()?;
    tracing::debug!(?cli, "Starting.");
    match &cli.cmd {
        Cmd::Server => ferret::server::run().await,
        Cmd::SetWebhook { url } => {
            let conf = ferret::conf::global();
            anyhow::ensure!(
                conf.telegram.is_enabled(),
                "No bot token configured."
            );
            ferret::bot::set_webhook(&conf.telegram, url.clone()).await
        }
        Cmd::GiftCode { code, uses } => {
            let conf = ferret::conf::global();
            let store = JsonFileStore::open(&conf.data_file)?;
            let ledger = Ledger::new(store, conf.daily_limit);
            ledger.create_code(code, *uses).await?;
            println!("{code}");
            Ok(())
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

fn human_panic_setup() {
    macro_rules! repo {
        () => {
            env!("CARGO_PKG_REPOSITORY")
        };
    }
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .homepage(repo!())
    .support(concat!("- Submit an issue at ", repo!(), "/issues")));
}
