use clap::{App, Arg};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn, Level};
use vendbus::bus;
use vendbus::fault::{FaultKind, FaultMonitor, RecoveryAction};
use vendbus::hal::{Clock, ResetMarkerFile, SchedulerFlag, SimulatedWatchdog, SystemClock};
use vendbus::link::{BroadcastUplink, LinkHandler};
use vendbus::peripherals::display::{self, ConsoleLcd, LcdPanel, SharedBus};
use vendbus::peripherals::keypad::{self, KeypadGate};
use vendbus::peripherals::motor::{self, TracingMux};
use vendbus::peripherals::stock::{self, RangeSensor, StockMonitor, MAX_SENSORS};
use vendbus::peripherals::DisplayMessage;
use vendbus::protocol::OutboundBuffer;
use vendbus::state::StateView;
use vendbus::supervision::SupervisionNotifier;
use vendbus::watchdog::{TaskId, WatchdogHardware, WatchdogSupervisor};
use vendbus::{MachineConfig, Orchestrator};

const OUTBOUND_BROADCAST_BUFFER_SIZE: usize = 64;
const KEYPAD_INPUT_BUFFER_SIZE: usize = 32;
const EXPIRY_POLL: Duration = Duration::from_millis(100);
const LINK_HEARTBEAT: Duration = Duration::from_millis(1000);

/// Simulated I2C bus carrying the LCD and the time-of-flight sensors.
struct SimI2c {
    lcd: ConsoleLcd,
    distances: [u8; MAX_SENSORS],
    rng: u32,
}

impl SimI2c {
    fn new(seed: u32) -> Self {
        Self { lcd: ConsoleLcd::new(), distances: [40; MAX_SENSORS], rng: seed | 1 }
    }

    fn next_random(&mut self) -> u32 {
        // xorshift32
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }
}

impl LcdPanel for SimI2c {
    fn write_frame(&mut self, message: &DisplayMessage) {
        self.lcd.write_frame(message);
    }
}

impl RangeSensor for SimI2c {
    fn read_mm(&mut self, sensor_id: u8) -> Option<u8> {
        let roll = self.next_random();
        if roll % 64 == 0 {
            return None;
        }
        // Columns slowly empty; the gap above the products grows.
        let gap = self.distances.get_mut(usize::from(sensor_id))?;
        if roll % 16 == 1 {
            *gap = gap.saturating_add(1).min(200);
        }
        Some(*gap)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("vendbus-sim")
        .version("0.1.0")
        .author("Vending Systems Engineering Team")
        .about("🥤 Vending machine controller simulator")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON machine configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => MachineConfig::from_json_file(path)?,
        None => MachineConfig::default(),
    };
    config.validate()?;

    println!("🥤 Vending Machine Simulator");
    println!("============================");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let hardware_watchdog = SimulatedWatchdog::new(Arc::clone(&clock));
    let reset_marker = ResetMarkerFile::new(&config.reset_marker_path);
    let scheduler = SchedulerFlag::new(false);
    let uplink = BroadcastUplink::new(OUTBOUND_BROADCAST_BUFFER_SIZE);

    let supervisor = Arc::new(
        WatchdogSupervisor::new(
            config.watchdog.clone(),
            WatchdogHardware {
                watchdog: Box::new(hardware_watchdog.clone()),
                reset_cause: Box::new(reset_marker.clone()),
                scheduler: Arc::new(scheduler.clone()),
                clock: Arc::clone(&clock),
            },
        )
        .with_notifications(
            SupervisionNotifier::new(&config.machine_id, config.supervision.cooldown_ms),
            Box::new(uplink.clone()),
        ),
    );

    let boot = supervisor.init();
    if boot.watchdog_reset {
        warn!("♻️ booted after a watchdog reset, running degraded");
    }
    for id in TaskId::ALL {
        supervisor.register(id, config.watchdog.tasks.max_interval(id))?;
    }

    let (publisher, inbox) = bus::channel(config.bus.capacity);
    let view = StateView::new();
    let i2c = SharedBus::new(SimI2c::new(std::process::id()));

    let (display_handle, frames) = display::channel();
    let (motor_handle, motor_service) = motor::channel(
        config.motor.queue_len,
        TracingMux::new(),
        publisher.clone(),
        Duration::from_millis(config.motor.run_time_ms),
    );
    let orchestrator = Orchestrator::new(
        &config.orchestrator,
        Box::new(display_handle),
        Box::new(motor_handle),
        Box::new(uplink.clone()),
        view.clone(),
    );
    let link = Arc::new(Mutex::new(LinkHandler::new(
        config.link.inter_byte_timeout_ms,
        publisher.clone(),
        view.clone(),
        Box::new(uplink.clone()),
    )));

    let listener = TcpListener::bind(&config.link.bind_addr).await?;
    info!("🌐 Network link listening on {}", config.link.bind_addr);

    let (key_tx, key_rx) = mpsc::channel(KEYPAD_INPUT_BUFFER_SIZE);
    let stdin_reader = tokio::spawn(read_keypad_from_stdin(key_tx));

    let mut tasks = JoinSet::new();
    spawn_task(
        &mut tasks,
        TaskId::Orchestrator,
        orchestrator.run(inbox, Arc::clone(&supervisor)),
    );
    spawn_task(
        &mut tasks,
        TaskId::Keypad,
        keypad::run(key_rx, KeypadGate::new(), publisher.clone(), Arc::clone(&supervisor), Arc::clone(&clock)),
    );
    spawn_task(&mut tasks, TaskId::Display, display::run(frames, i2c.clone(), Arc::clone(&supervisor)));
    spawn_task(
        &mut tasks,
        TaskId::NetworkLink,
        run_link_server(listener, link, uplink.clone(), Arc::clone(&clock), Arc::clone(&supervisor)),
    );
    spawn_task(&mut tasks, TaskId::Motor, motor_service.run(Arc::clone(&supervisor)));
    spawn_task(
        &mut tasks,
        TaskId::StockSensor,
        stock::run(
            i2c,
            config.stock.sensor_count,
            StockMonitor::new(config.stock.threshold_mm),
            publisher,
            Arc::clone(&supervisor),
            Duration::from_millis(config.stock.poll_interval_ms),
        ),
    );
    let watchdog_task = tokio::spawn(Arc::clone(&supervisor).run());
    scheduler.set_running(true);
    info!("🚀 All tasks started, type keys (0-9 * #) and press enter");

    let mut faults = FaultMonitor::new();
    let mut expiry = time::interval(EXPIRY_POLL);
    loop {
        tokio::select! {
            Some(joined) = tasks.join_next() => {
                if let Some(action) = handle_task_exit(joined, &mut faults, &supervisor, clock.now_ms()) {
                    if action == RecoveryAction::ForceReset {
                        error!("💥 fault limit reached, forcing a reset");
                        break;
                    }
                }
            }
            _ = expiry.tick() => {
                if hardware_watchdog.expired() {
                    error!("💥 hardware watchdog expired, resetting");
                    if let Err(e) = reset_marker.mark() {
                        error!("Failed to write reset marker: {}", e);
                    }
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    scheduler.set_running(false);
    watchdog_task.abort();
    stdin_reader.abort();
    tasks.abort_all();
    supervisor.log_status();
    println!("🛑 Vending Machine Simulator stopped");

    Ok(())
}

type TaskExit = (TaskId, Result<(), JoinError>);

fn spawn_task<F>(tasks: &mut JoinSet<TaskExit>, id: TaskId, task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(task);
    tasks.spawn(async move { (id, handle.await) });
}

// A panicked task is treated like a stack overflow in that task.
fn handle_task_exit(
    joined: Result<TaskExit, JoinError>,
    faults: &mut FaultMonitor,
    supervisor: &WatchdogSupervisor,
    now_ms: u64,
) -> Option<RecoveryAction> {
    let (id, result) = match joined {
        Ok(exit) => exit,
        Err(e) => {
            error!("Task monitor failed: {}", e);
            return None;
        }
    };
    match result {
        Ok(()) => {
            warn!("Task {} exited", id.name());
            None
        }
        Err(e) if e.is_panic() => {
            let action = faults.record(FaultKind::StackOverflow, Some(id), now_ms);
            error!("❌ Task {} crashed, recovery: {:?}", id.name(), action);
            if action == RecoveryAction::TerminateTask && id.is_optional() {
                if let Err(e) = supervisor.enable_task(id, false) {
                    warn!("Could not stop monitoring {}: {}", id.name(), e);
                }
            }
            Some(action)
        }
        Err(_) => None,
    }
}

async fn read_keypad_from_stdin(keys: mpsc::Sender<char>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                for c in line.trim().chars() {
                    if keys.send(c).await.is_err() {
                        return;
                    }
                    // Stay above the keypad's minimum press interval.
                    time::sleep(Duration::from_millis(120)).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read error: {}", e);
                break;
            }
        }
    }
    // Keep the keypad channel open so the keypad task keeps running idle.
    info!("⌨️ stdin closed, keypad idle");
    std::future::pending::<()>().await;
}

async fn run_link_server(
    listener: TcpListener,
    link: Arc<Mutex<LinkHandler>>,
    uplink: BroadcastUplink,
    clock: Arc<dyn Clock>,
    supervisor: Arc<WatchdogSupervisor>,
) {
    let mut heartbeat = time::interval(LINK_HEARTBEAT);
    loop {
        tokio::select! {
            _ = heartbeat.tick() => supervisor.heartbeat(TaskId::NetworkLink),
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("🔗 Network node connected: {}", addr);
                    let link = Arc::clone(&link);
                    let outbound = uplink.subscribe();
                    let clock = Arc::clone(&clock);
                    tokio::spawn(async move {
                        if let Err(e) = handle_peer(stream, link, outbound, clock).await {
                            warn!("Peer {} error: {}", addr, e);
                        }
                        info!("🔌 Network node {} disconnected", addr);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
        }
    }
}

async fn handle_peer(
    stream: TcpStream,
    link: Arc<Mutex<LinkHandler>>,
    mut outbound: broadcast::Receiver<OutboundBuffer>,
    clock: Arc<dyn Clock>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        loop {
            match outbound.recv().await {
                Ok(line) => {
                    if writer.write_all(line.as_bytes()).await.is_err()
                        || writer.write_all(b"\r\n").await.is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Peer lagging, {} outbound lines skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut buf = [0u8; 256];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let published = link.lock().feed(&buf[..n], clock.now_ms());
        for event in published {
            debug!("📨 link event {:?}", event);
        }
    }

    writer_task.abort();
    Ok(())
}
