use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use vendbus::protocol::{MAX_LINE_LEN, MAX_VEND_QTY};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_WAIT_MS: &str = "1500";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("vendbus")
        .version("0.1.0")
        .author("Vending Systems Engineering Team")
        .about("🥤 Network node console for the vending machine simulator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator link port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("wait")
                .short("w")
                .long("wait")
                .value_name("MILLIS")
                .help("How long to collect replies after sending")
                .takes_value(true)
                .default_value(DEFAULT_WAIT_MS)
                .global(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Wait must be a number of milliseconds".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Print the lines being sent")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("pay")
                .about("💳 Report a successful card read")
                .arg(Arg::with_name("uid").help("Card UID").default_value("04A1B2C3")),
        )
        .subcommand(
            SubCommand::with_name("decline")
                .about("🚫 Report a failed card read")
                .arg(Arg::with_name("reason").help("Error text").default_value("READ_FAILED")),
        )
        .subcommand(SubCommand::with_name("no-net").about("📵 Report that the payment backend is unreachable"))
        .subcommand(
            SubCommand::with_name("order")
                .about("📦 Remote order session")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("start")
                        .about("Open an order session")
                        .arg(Arg::with_name("id").help("Order id").required(true)),
                )
                .subcommand(
                    SubCommand::with_name("vend")
                        .about("Vend one item of the open order")
                        .arg(Arg::with_name("slot").help("Slot 1-4").required(true))
                        .arg(Arg::with_name("qty").help("Quantity 1-10").required(true))
                        .arg(Arg::with_name("product").help("Product id").required(true)),
                )
                .subcommand(SubCommand::with_name("end").about("Complete the open order"))
                .subcommand(SubCommand::with_name("fail").about("Abort the open order")),
        )
        .subcommand(
            SubCommand::with_name("raw")
                .about("✉️  Send one protocol line verbatim")
                .arg(Arg::with_name("line").help("Line without terminator").required(true)),
        )
        .subcommand(SubCommand::with_name("listen").about("👂 Print every line the machine sends"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let wait = Duration::from_millis(matches.value_of("wait").unwrap_or(DEFAULT_WAIT_MS).parse()?);
    let verbose = matches.is_present("verbose");

    let line = match matches.subcommand() {
        ("listen", _) => return listen(host, port).await,
        ("pay", Some(sub)) => format!("NFC_UID:{}", sub.value_of("uid").unwrap_or_default()),
        ("decline", Some(sub)) => format!("NFC_ERR:{}", sub.value_of("reason").unwrap_or_default()),
        ("no-net", _) => "NO_NETWORK".to_string(),
        ("order", Some(sub)) => order_line(sub)?,
        ("raw", Some(sub)) => sub.value_of("line").unwrap_or_default().to_string(),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            return Ok(());
        }
    };

    if line.len() > MAX_LINE_LEN {
        eprintln!("{} Line is longer than {} bytes and would be discarded", "⚠️".yellow(), MAX_LINE_LEN);
    }
    if verbose {
        println!("{} {}", "→".dimmed(), line.bright_white());
    }
    send_line(host, port, &line, wait).await
}

fn order_line(matches: &ArgMatches<'_>) -> Result<String, Box<dyn std::error::Error>> {
    match matches.subcommand() {
        ("start", Some(sub)) => Ok(format!("ORDER_START:{}", sub.value_of("id").unwrap_or_default())),
        ("vend", Some(sub)) => {
            let slot = sub.value_of("slot").unwrap_or_default();
            let qty = sub.value_of("qty").unwrap_or_default();
            if let Ok(q) = qty.parse::<u8>() {
                if q == 0 || q > MAX_VEND_QTY {
                    eprintln!("{} Quantity {} will be rejected by the machine", "💡".yellow(), q);
                }
            }
            Ok(format!("VEND {} {} {}", slot, qty, sub.value_of("product").unwrap_or_default()))
        }
        ("end", _) => Ok("ORDER_END".to_string()),
        ("fail", _) => Ok("ORDER_FAILED".to_string()),
        _ => Err("Unknown order command".into()),
    }
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to the machine at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Simulator is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin vendbus-sim".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn send_line(host: &str, port: u16, line: &str, wait: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;

    let mut replies = BufReader::new(reader).lines();
    let deadline = tokio::time::Instant::now() + wait;
    let mut received = 0;
    while let Ok(next) = tokio::time::timeout_at(deadline, replies.next_line()).await {
        match next? {
            Some(reply) => {
                print_reply(&reply);
                received += 1;
            }
            None => break,
        }
    }
    if received == 0 {
        println!("{} {}", "✅".green(), "Sent, no reply".dimmed());
    }
    Ok(())
}

async fn listen(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    println!("{}", "👂 Listening for machine lines, Ctrl+C to stop".bright_blue().bold());
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        print_reply(&line);
    }
    println!("{}", "Connection closed".dimmed());
    Ok(())
}

fn print_reply(line: &str) {
    let (name, rest) = line.split_once(':').unwrap_or((line, ""));
    let tag = match name {
        "ORDER_ACK" | "VEND_COMPLETED" | "DELIVERY_COMPLETED" => name.bright_green(),
        "ORDER_NAK" | "VEND_FAILED" | "DELIVERY_FAILED" => name.bright_red(),
        "STATE_PAYING" => name.bright_cyan(),
        "SUPERVISION_ERROR" => name.bright_yellow(),
        _ => name.normal(),
    };
    if rest.is_empty() {
        println!("{} {}", "←".dimmed(), tag);
    } else if let Some(json) = (name == "SUPERVISION_ERROR")
        .then(|| serde_json::from_str::<serde_json::Value>(rest).ok())
        .flatten()
    {
        let kind = json["error_type"].as_str().unwrap_or("?");
        let message = json["message"].as_str().unwrap_or("");
        println!("{} {} {} {}", "←".dimmed(), tag, kind.bright_white(), message);
    } else {
        println!("{} {}:{}", "←".dimmed(), tag, rest);
    }
}
