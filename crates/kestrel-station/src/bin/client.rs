// Kestrel station client

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kestrel_core::MacAddress;
use kestrel_station::{
    DiscoveredStation, DiscoveryCommand, Frame, Keyword, StationClient, StreamCommand, discover,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Talk to Kestrel test stations
#[derive(Parser, Debug)]
#[command(name = "kestrel-client")]
#[command(about = "Discover and monitor Kestrel test stations", long_about = None)]
struct Cli {
    /// MAC address announced in discovery datagrams
    #[arg(long, default_value = "02:00:00:00:00:01")]
    mac: MacAddress,

    /// Seconds to wait for replies
    #[arg(short, long, default_value_t = 2)]
    timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast for stations and list the ones that answer
    Discover {
        /// Discovery address (e.g., 255.255.255.255:5150)
        #[arg(long, default_value = "255.255.255.255:5150")]
        target: SocketAddr,

        /// Only list stations testing one of these serial numbers
        #[arg(long, value_delimiter = ',')]
        serials: Vec<String>,
    },

    /// Look up a user's access level
    Auth {
        #[arg(long, default_value = "255.255.255.255:5150")]
        target: SocketAddr,

        #[arg(long)]
        user: String,
    },

    /// Stream test results; lines typed on stdin answer open questions
    Watch {
        /// Station command address (e.g., 192.168.1.40:5200)
        #[arg(short, long)]
        station: SocketAddr,
    },

    /// Answer the pending question
    Answer {
        #[arg(short, long)]
        station: SocketAddr,

        answer: String,
    },

    /// Take the repair lock and hold it, renewing until interrupted
    Lock {
        #[arg(short, long)]
        station: SocketAddr,

        /// Seconds between renewals
        #[arg(long, default_value_t = 30)]
        renew_every: u64,
    },

    /// Fetch a log file (or the listing, with no name)
    GetFile {
        #[arg(short, long)]
        station: SocketAddr,

        name: Option<String>,

        /// Write the file here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let wait = Duration::from_secs(cli.timeout);
    match cli.command {
        Command::Discover { target, serials } => {
            let (command, extra) = if serials.is_empty() {
                (DiscoveryCommand::InitialBroadcast, String::new())
            } else {
                (DiscoveryCommand::DefaultBroadcast, serials.join(","))
            };
            let extra: Vec<&str> = if extra.is_empty() { vec![] } else { vec![extra.as_str()] };
            let replies = discover(target, command, cli.mac, &extra, wait).await?;
            if replies.is_empty() {
                info!("No stations answered");
            }
            for (from, frame) in replies {
                if frame.keyword != Keyword::BoardInfo {
                    continue;
                }
                let station = DiscoveredStation::parse(from, &frame.text())?;
                println!("{}  {}  {}", station.stream_addr(), station.name, station.board);
            }
        }
        Command::Auth { target, user } => {
            let replies = discover(
                target,
                DiscoveryCommand::UserAuthentication,
                cli.mac,
                &[user.as_str()],
                wait,
            )
            .await?;
            let (from, frame) = replies
                .into_iter()
                .find(|(_, frame)| frame.keyword == Keyword::AuthLevel)
                .context("no station answered the authentication request")?;
            println!("{}: {}", from, frame.text());
        }
        Command::Watch { station } => watch(station).await?,
        Command::Answer { station, answer } => {
            let mut client = StationClient::connect(station).await?;
            client
                .send_command(StreamCommand::QuestionResponse, &answer)
                .await?;
            info!("Sent answer {:?}", answer);
            // Answers get no reply; closing at once would release the slot
            // before the station runs the command.
            let _ = tokio::time::timeout(wait, client.read_frame()).await;
        }
        Command::Lock {
            station,
            renew_every,
        } => hold_lock(station, wait, Duration::from_secs(renew_every)).await?,
        Command::GetFile {
            station,
            name,
            output,
        } => {
            let mut client = StationClient::connect(station).await?;
            client
                .send_command(StreamCommand::GetFile, name.as_deref().unwrap_or_default())
                .await?;
            let frame = read_reply(&mut client, wait).await?;
            match frame.keyword {
                Keyword::FileList => println!("{}", frame.text()),
                Keyword::FileData => match output {
                    Some(path) => {
                        tokio::fs::write(&path, &frame.payload).await?;
                        info!("Wrote {} bytes to {}", frame.payload.len(), path.display());
                    }
                    None => print!("{}", frame.text()),
                },
                Keyword::Error => bail!("station refused: {}", frame.text()),
                other => bail!("unexpected reply {}", other.as_str()),
            }
        }
    }

    Ok(())
}

async fn read_reply(client: &mut StationClient, wait: Duration) -> Result<Frame> {
    loop {
        let frame = tokio::time::timeout(wait, client.read_frame())
            .await
            .context("timed out waiting for the station")??;
        // Pushes for other views can interleave with the reply.
        match frame.keyword {
            Keyword::TestData | Keyword::DiagnosticData | Keyword::MessageBoxClose => {
                debug!("Skipping {}", frame.keyword.as_str());
            }
            _ => return Ok(frame),
        }
    }
}

async fn watch(station: SocketAddr) -> Result<()> {
    let client = StationClient::connect(station).await?;
    let (mut reader, mut writer) = client.into_split();
    writer.send_command(StreamCommand::GetTestData, "").await?;

    // read_frame is not cancel safe, so frames come through a channel.
    let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(64);
    tokio::spawn(async move {
        loop {
            match reader.read_frame().await {
                Ok(frame) => {
                    if frames_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Station connection ended: {}", e);
                    break;
                }
            }
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut question_open = false;
    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                let Some(frame) = frame else {
                    info!("Station closed the connection");
                    break;
                };
                match frame.keyword {
                    Keyword::TestData => print_records("TEST", &frame),
                    Keyword::DiagnosticData => print_records("DIAG", &frame),
                    Keyword::MessageBoxOpen => {
                        question_open = true;
                        println!("QUESTION {}", frame.text().replace('\n', ": "));
                    }
                    Keyword::MessageBoxClose => {
                        if question_open {
                            println!("QUESTION closed");
                        }
                        question_open = false;
                    }
                    other => println!("{} {}", other.as_str(), frame.text()),
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) if question_open => {
                        writer.send_command(StreamCommand::QuestionResponse, line.trim()).await?;
                        question_open = false;
                    }
                    Some(line) if line.trim().eq_ignore_ascii_case("release") => {
                        writer.send_command(StreamCommand::ReleaseQuestionHold, "").await?;
                    }
                    Some(_) => warn!("No question is open"),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_records(label: &str, frame: &Frame) {
    let text = frame.text();
    let mut lines = text.lines();
    let first: usize = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);
    for (i, line) in lines.enumerate() {
        println!("{} {:>5} {}", label, first + i, line);
    }
}

async fn hold_lock(station: SocketAddr, wait: Duration, renew_every: Duration) -> Result<()> {
    let mut client = StationClient::connect(station).await?;
    loop {
        client
            .send_command(StreamCommand::RepairLockBoard, "")
            .await?;
        let reply = client.expect(Keyword::RepairLock, wait).await?.text();
        if reply != "LOCKED" {
            bail!("repair lock not granted: {}", reply);
        }
        debug!("Repair lock held");

        tokio::select! {
            _ = tokio::time::sleep(renew_every) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client
        .send_command(StreamCommand::RepairUnlockBoard, "")
        .await?;
    let reply = client.expect(Keyword::RepairLock, wait).await?.text();
    info!("Repair lock released: {}", reply);
    Ok(())
}
