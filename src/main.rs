mod workers;

use anyhow::anyhow;
use peerlink::utils::sos::SignalOfStop;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory (must happen before any persistence access)
    peerlink::utils::data_dir::init(args.data_dir.as_deref());
    let data_dir = peerlink::utils::data_dir::get();

    let log_path = data_dir.join("logs").join("peerlink.log");
    peerlink::utils::logging::init(args.verbose, &log_path)?;

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command.clone() {
        Some(Command::Demo { file }) => {
            workers::demo::run(file, args.download_dir(data_dir), sos).await
        }
        Some(Command::Keygen) => workers::tools::keygen(),
        Some(Command::Transfers) => workers::tools::transfers(),
        Some(Command::Seal { to, secret, text }) => workers::tools::seal(&to, &secret, &text),
        Some(Command::Open {
            from,
            secret,
            nonce,
            ciphertext,
        }) => workers::tools::open(&from, &secret, &nonce, &ciphertext),
        None => Err(anyhow!("no command given, see --help")),
    }
}
