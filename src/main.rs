use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wordex", about = "Realtime word-game server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    wordex::config::run(&args.listen).await;
}
