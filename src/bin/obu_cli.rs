use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use obu::bridge::{BridgeCommand, BridgeMessage, BridgeRequest, BridgeResponse, ResponseStatus};
use obu::protocol::device;
use obu::{ObuStatus, Order};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8090";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("obu-cli")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("🚗 Operator console for the on-board unit supervisor")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bridge port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Test connection to the bridge"))
        .subcommand(SubCommand::with_name("status").about("📊 Show the supervisor status snapshot"))
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📈 Follow the periodic status snapshots")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Monitor duration in seconds (default: infinite)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("inject")
                .about("💉 Put a raw frame on the bus")
                .arg(Arg::with_name("device").help("Device token").required(true))
                .arg(Arg::with_name("order").help("Order token").required(true))
                .arg(
                    Arg::with_name("payload")
                        .help("Unsigned payload")
                        .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|e| e.to_string())),
                ),
        )
        .subcommand(
            SubCommand::with_name("traffic")
                .about("🔎 Show recent bus frames")
                .arg(
                    Arg::with_name("limit")
                        .short("n")
                        .long("limit")
                        .takes_value(true)
                        .default_value("20"),
                ),
        )
        .subcommand(
            SubCommand::with_name("mode")
                .about("🎛️  Flip the auto/manual selector")
                .arg(
                    Arg::with_name("mode")
                        .required(true)
                        .possible_values(&["auto", "manual"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("direction")
                .about("↕️  Flip the direction selector")
                .arg(
                    Arg::with_name("direction")
                        .required(true)
                        .possible_values(&["forward", "reverse"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("pedal")
                .about("🦶 Send an accelerator pedal reading")
                .arg(
                    Arg::with_name("value")
                        .help("Pedal reading (0-1023)")
                        .required(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(value) if value <= 1023 => Ok(()),
                            _ => Err("pedal reading must be between 0 and 1023".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("steer")
                .about("🛞 Send a steering target")
                .arg(
                    Arg::with_name("target")
                        .required(true)
                        .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|e| e.to_string())),
                ),
        )
        .subcommand(
            SubCommand::with_name("park")
                .about("🅿️  Press the park button")
                .arg(Arg::with_name("release").long("release").help("Release the park button")),
        )
        .subcommand(SubCommand::with_name("emergency-stop").about("🛑 Send brake_enable (shuts the supervisor down)"))
        .subcommand(SubCommand::with_name("shutdown").about("⏻  Stop the simulator process"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let client = Client { host, port, format };

    match matches.subcommand() {
        ("ping", _) => client.ping().await?,
        ("status", _) => client.status().await?,
        ("monitor", Some(sub)) => client.monitor(sub).await?,
        ("inject", Some(sub)) => {
            let device = sub.value_of("device").unwrap_or_default();
            let order = sub.value_of("order").unwrap_or_default();
            let payload = sub.value_of("payload").map(str::parse::<u64>).transpose()?;
            client.inject("Frame", device, order, payload).await?;
        }
        ("traffic", Some(sub)) => {
            let limit = sub.value_of("limit").unwrap_or("20").parse::<usize>()?;
            client.traffic(limit).await?;
        }
        ("mode", Some(sub)) => {
            // Selector reads 0 for auto.
            let payload = if sub.value_of("mode") == Some("auto") { 0 } else { 1 };
            client.order("Mode selector", Order::BoutonAutoManu, Some(payload)).await?;
        }
        ("direction", Some(sub)) => {
            let payload = if sub.value_of("direction") == Some("forward") { 1 } else { 0 };
            client.order("Direction selector", Order::BoutonReverse, Some(payload)).await?;
        }
        ("pedal", Some(sub)) => {
            let value = sub.value_of("value").unwrap_or("0").parse::<u64>()?;
            client.order("Pedal", Order::AccelPedal, Some(value)).await?;
        }
        ("steer", Some(sub)) => {
            let target = sub.value_of("target").unwrap_or("0").parse::<u64>()?;
            client.order("Steering target", Order::SteerTarget, Some(target)).await?;
        }
        ("park", Some(sub)) => {
            let payload = if sub.is_present("release") { 0 } else { 1 };
            client.order("Park", Order::BoutonPark, Some(payload)).await?;
        }
        ("emergency-stop", _) => client.order("Emergency stop", Order::BrakeEnable, None).await?,
        ("shutdown", _) => {
            let response = client.request(BridgeRequest::Shutdown).await?;
            client.print_result("Shutdown", &response);
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the supervisor", "obu".bright_cyan());
            println!("  {} Test connection", "obu-cli ping".bright_cyan());
            println!("  {} Follow the status", "obu-cli monitor".bright_cyan());
        }
    }

    Ok(())
}

async fn read_response<R>(reader: &mut R) -> Result<BridgeResponse, Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err("bridge closed connection".into());
        }
        if let Ok(BridgeMessage::Response(response)) = serde_json::from_str(line.trim()) {
            return Ok(response);
        }
    }
}

struct Client<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
}

impl Client<'_> {
    async fn connect(&self) -> Result<TcpStream, Box<dyn std::error::Error>> {
        let addr = format!("{}:{}", self.host, self.port);
        match TcpStream::connect(&addr).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                eprintln!("{} Failed to connect to the bridge at {}", "❌".red(), addr.bright_white());
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("{} Supervisor is not running. Start it with:", "💡".yellow());
                    eprintln!("   {}", "obu".bright_cyan());
                }
                Err(e.into())
            }
        }
    }

    /// Send one request and wait for its response, skipping snapshots.
    async fn request(&self, request: BridgeRequest) -> Result<BridgeResponse, Box<dyn std::error::Error>> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let id = std::process::id();
        let line = serde_json::to_string(&BridgeCommand { id, request })?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        match tokio::time::timeout(RESPONSE_TIMEOUT, read_response(&mut reader)).await {
            Ok(result) => result,
            Err(_) => {
                eprintln!("{} Request timed out after {:?}", "⏰".yellow(), RESPONSE_TIMEOUT);
                Err("request timeout".into())
            }
        }
    }

    async fn ping(&self) -> Result<(), Box<dyn std::error::Error>> {
        let response = self.request(BridgeRequest::Ping).await?;
        match self.format {
            "json" => println!("{}", serde_json::to_string(&response)?),
            "compact" => println!("{}", "PONG".bright_green()),
            _ => {
                if response.status == ResponseStatus::Success {
                    println!("{} {}", "✅".green(), "Supervisor is responsive".bright_green());
                } else {
                    println!("{} {}", "❌".red(), "Ping failed".bright_red());
                }
            }
        }
        Ok(())
    }

    async fn status(&self) -> Result<(), Box<dyn std::error::Error>> {
        let response = self.request(BridgeRequest::Status).await?;
        match response.snapshot {
            Some(status) => self.print_status(&status)?,
            None => self.print_result("Status", &response),
        }
        Ok(())
    }

    async fn monitor(&self, matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
        let duration = matches
            .value_of("duration")
            .map(str::parse::<u64>)
            .transpose()?
            .map(Duration::from_secs);
        println!("{}", "📡 Monitoring supervisor status (Press Ctrl+C to stop)...".bright_blue().bold());

        let stream = self.connect().await?;
        let mut reader = BufReader::new(stream);
        let started = Instant::now();
        let mut line = String::new();
        loop {
            if duration.is_some_and(|limit| started.elapsed() >= limit) {
                break;
            }
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                println!("{}", "Bridge closed the connection".yellow());
                break;
            }
            if let Ok(BridgeMessage::Snapshot { status }) = serde_json::from_str(line.trim()) {
                self.print_status(&status)?;
            }
        }
        Ok(())
    }

    async fn traffic(&self, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
        let response = self.request(BridgeRequest::Traffic { limit }).await?;
        let Some(frames) = &response.frames else {
            self.print_result("Traffic", &response);
            return Ok(());
        };
        match self.format {
            "json" => println!("{}", serde_json::to_string(&response)?),
            _ => {
                for frame in frames {
                    let bytes: Vec<String> = frame.data.iter().map(|b| format!("{b:02X}")).collect();
                    println!(
                        "{} {:>8} {:<18} [{}]",
                        format!("{:#06x}", frame.address).dimmed(),
                        frame.device.bright_white(),
                        frame.order.bright_cyan(),
                        bytes.join(" ")
                    );
                }
            }
        }
        Ok(())
    }

    async fn inject(
        &self,
        action: &str,
        device: &str,
        order: &str,
        payload: Option<u64>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let response = self
            .request(BridgeRequest::Inject {
                device: device.to_string(),
                order: order.to_string(),
                payload,
            })
            .await?;
        self.print_result(action, &response);
        Ok(())
    }

    /// Operator inputs are all addressed to the supervisor.
    async fn order(&self, action: &str, order: Order, payload: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
        self.inject(action, device::OBU, order.as_token(), payload).await
    }

    fn print_result(&self, action: &str, response: &BridgeResponse) {
        match self.format {
            "json" => match serde_json::to_string(response) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("{} {}", "❌".red(), e),
            },
            "compact" => match response.status {
                ResponseStatus::Success => println!("{}", "OK".bright_green()),
                _ => println!("{}", "FAILED".bright_red()),
            },
            _ => {
                let message = response.message.as_deref().unwrap_or("");
                match response.status {
                    ResponseStatus::Success => {
                        println!("{} {} sent", "✅".green(), action.bright_white());
                    }
                    ResponseStatus::Error => {
                        println!("{} {} failed: {}", "❌".red(), action.bright_white(), message.bright_red());
                    }
                    ResponseStatus::InvalidRequest => {
                        println!("{} {} rejected: {}", "❓".blue(), action.bright_white(), message);
                    }
                }
            }
        }
    }

    fn print_status(&self, status: &ObuStatus) -> Result<(), Box<dyn std::error::Error>> {
        match self.format {
            "json" => println!("{}", serde_json::to_string(status)?),
            "compact" => println!(
                "mode={} state={:?} torque={:.2} faults={}",
                status.mode,
                status.state,
                status.last_torque.unwrap_or(0.0),
                status.faults.active
            ),
            _ => {
                let mode = match status.mode {
                    obu::Mode::Manual | obu::Mode::Auto => status.mode.to_string().bright_green(),
                    obu::Mode::Error | obu::Mode::Off => status.mode.to_string().bright_red(),
                    _ => status.mode.to_string().yellow(),
                };
                println!("{} {}", "📊".bright_blue(), "Supervisor Status".bright_blue().bold());
                println!("  {:<18} {}", "Mode:".bright_white(), mode);
                println!("  {:<18} {:?}", "Drive state:".bright_white(), status.state);
                println!("  {:<18} {:?}", "Ready:".bright_white(), status.readiness);
                println!("  {:<18} {}", "Motor ready:".bright_white(), status.motor_ready);
                println!(
                    "  {:<18} {}",
                    "Torque:".bright_white(),
                    status.last_torque.map_or("-".to_string(), |t| format!("{t:.2}"))
                );
                println!(
                    "  {:<18} enabled={} target={:?} measured={:?}",
                    "Steering:".bright_white(),
                    status.steering.enabled,
                    status.steering.target,
                    status.steering.measurement
                );
                println!("  {:<18} {}", "Trajectory:".bright_white(), status.trajectory_active);
                println!(
                    "  {:<18} handled={} duplicates={}",
                    "Messages:".bright_white(),
                    status.messages_handled,
                    status.dispatch.duplicates_suppressed
                );
                let faults = if status.faults.active > 0 {
                    status.faults.active.to_string().bright_red()
                } else {
                    "0".bright_green()
                };
                println!("  {:<18} {} active / {} total", "Faults:".bright_white(), faults, status.faults.total_recorded);
                println!("  {:<18} {} ms", "Uptime:".bright_white(), status.uptime_ms);
            }
        }
        Ok(())
    }
}
