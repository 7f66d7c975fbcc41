use clap::Parser;

use btclient::{
    config::cfg::Cfg, session::session::Session, torrent_parser::parser::TorrentParser,
};

#[derive(Parser, Debug)]
struct Args {
    /// Path to the torrent file to download.
    #[arg(short, long)]
    torrent: String,
    /// Optional config file; missing keys use their defaults.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Cfg::new(path).expect("Config file not found or invalid"),
        None => Cfg::default(),
    };

    let torrent = TorrentParser::parse(&args.torrent).expect("Could not parse the torrent file");
    println!(
        "Downloading {} ({} pieces) ...",
        torrent.name(),
        torrent.total_pieces()
    );

    let session = Session::new(torrent, config).expect("Could not create the session");
    match session.run().await {
        Ok(()) => println!("Download complete."),
        Err(err) => {
            eprintln!("Download failed: {:?}", err);
            std::process::exit(1);
        }
    }
}
