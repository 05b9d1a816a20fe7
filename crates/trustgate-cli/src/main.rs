//! `trustgate-cli` – node daemon.
//!
//! 1. Loads `~/.trustgate/config.toml`, writing defaults on first run.
//! 2. Starts the interlock poller and the actuator loop.  Until the boot
//!    succeeds the loop only writes the safe state.
//! 3. Runs the trust-gated bootstrap.  A failed boot keeps the actuators
//!    neutral and exits with status 1.
//! 4. Streams telemetry to the console, routes JSON tasks read from stdin and
//!    re-attests periodically.
//! 5. On **Ctrl-C** (or SIGTERM) stops every context; the actuator loop's
//!    final act is a neutral write.

mod config;

use colored::Colorize;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use trustgate_hal::sim::SimBus;
use trustgate_hal::{DeviceBus, GpioEstopInput, HardwareBus, SysfsProbe};
use trustgate_kernel::{
    Attestor, CommandRouter, FailurePolicy, TaskDispatcher, TelemetryEvent, Vault,
};
use trustgate_runtime::{ActuatorLoopConfig, KernelHandles, KernelParts, init_tracing};
use trustgate_types::{KernelError, OperationMode, Task};

/// Exit status for a failed bootstrap.
const EXIT_BOOT_FAILED: i32 = 1;

fn main() {
    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    // Kept alive until `run` returns so pending spans are flushed.
    let _otel = init_tracing("trustgate");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_ctrlc = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Shutdown requested – neutralising actuators …".yellow().bold()
        );
        shutdown_ctrlc.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install signal handler; shutdown on Ctrl-C will not be graceful");
    }

    // ── Kernel ────────────────────────────────────────────────────────────
    let (kernel, telemetry) = match assemble(&cfg) {
        Ok((kernel, telemetry)) => (Arc::new(kernel), telemetry),
        Err(e) => {
            println!("{}: {}", "Kernel assembly failed".red().bold(), e);
            return EXIT_BOOT_FAILED;
        }
    };

    // ── Execution contexts ────────────────────────────────────────────────
    let mut poller = kernel.interlock_poller(cfg.interlock_poll_interval(), cfg.watchdog_timeout());
    if let Some(path) = &cfg.estop_gpio {
        poller = poller.with_input(Arc::new(
            GpioEstopInput::new("estop_gpio", path).active_low(cfg.estop_active_low),
        ));
    } else {
        warn!("No hardware E-stop configured; software stops only");
    }

    let actuator = match kernel.actuator_loop(
        ActuatorLoopConfig { hz: cfg.loop_hz },
        cfg.watchdog_timeout(),
    ) {
        Ok(actuator) => actuator,
        Err(e) => {
            println!("{}: {}", "Actuator loop rejected".red().bold(), e);
            neutralise(&kernel);
            return EXIT_BOOT_FAILED;
        }
    };

    let mut threads = Vec::new();
    match poller.spawn(shutdown.clone()) {
        Ok(h) => threads.push(h),
        Err(e) => error!(error = %e, "Failed to spawn interlock poller"),
    }
    match actuator.spawn(shutdown.clone()) {
        Ok(h) => threads.push(h),
        Err(e) => {
            error!(error = %e, "Failed to spawn actuator loop");
            shutdown.store(true, Ordering::SeqCst);
            join_all(threads);
            neutralise(&kernel);
            return EXIT_BOOT_FAILED;
        }
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            shutdown.store(true, Ordering::SeqCst);
            join_all(threads);
            return EXIT_BOOT_FAILED;
        }
    };
    rt.spawn(print_telemetry(telemetry));

    // ── Bootstrap ─────────────────────────────────────────────────────────
    let booted = Arc::new(AtomicBool::new(false));
    let boot_watch = spawn_boot_watch(kernel.clone(), cfg.watchdog_policy, booted.clone());
    let boot_result = kernel.bootstrap();
    booted.store(true, Ordering::SeqCst);
    if let Some(h) = boot_watch {
        join_all(vec![h]);
    }

    let exit_code = match boot_result {
        Ok(boot) => {
            println!();
            println!("  {} {}", "✓".green().bold(), boot.summary().bold());
            println!(
                "  Mode: {}  Power: {}",
                colour_mode(boot.mode.as_str(), boot.can_operate()),
                colour_mode(
                    boot.power_state().as_str(),
                    boot.power_state().drives_actuators()
                )
            );
            println!();
            println!(
                "  Send JSON tasks on stdin, e.g. {}\n",
                r#"{"type":"EMERGENCY_HALT","params":{"reason":"test"}}"#.dimmed()
            );

            let router = Arc::new(kernel.router(Arc::new(ConsoleDispatcher)));
            spawn_stdin_router(router);
            supervise(&kernel, &cfg, &shutdown)
        }
        Err(e) => {
            println!("{}: {}", "Bootstrap failed".red().bold(), e);
            EXIT_BOOT_FAILED
        }
    };

    // ── Shutdown ──────────────────────────────────────────────────────────
    shutdown.store(true, Ordering::SeqCst);
    join_all(threads);
    rt.shutdown_timeout(Duration::from_millis(200));

    println!("{}", "  ✓ Actuators neutral.".green());
    println!("{}", "  ✓ Exiting TrustGate.".green());
    exit_code
}

fn assemble(
    cfg: &config::Config,
) -> Result<(KernelHandles, tokio::sync::mpsc::Receiver<TelemetryEvent>), KernelError> {
    let bus: Arc<dyn HardwareBus> = match &cfg.bus_device {
        Some(path) => Arc::new(DeviceBus::open(path)?),
        None => {
            warn!("No bus_device configured; running dry against a simulated bus");
            Arc::new(SimBus::new())
        }
    };

    let mut probe =
        SysfsProbe::new(&cfg.sysfs_root).with_industrial_node_id(cfg.industrial_node_id.clone());
    if let Some(protocol) = &cfg.protocol {
        probe = probe.with_protocol(protocol.clone());
    }

    let binary = match &cfg.binary_path {
        Some(p) => p.clone(),
        None => std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/proc/self/exe")),
    };
    info!(vault = %cfg.vault_dir.display(), binary = %binary.display(), "Assembling kernel");

    KernelHandles::assemble(KernelParts {
        vault: Arc::new(Vault::open(&cfg.vault_dir)?),
        probe: Arc::new(probe),
        bus,
        attestor: Attestor::new(binary),
        boot: cfg.boot_config(),
        telemetry_capacity: cfg.telemetry_capacity,
        boot_timeout: cfg.boot_timeout(),
    })
}

/// Watch for frozen contexts and re-attest on schedule until shutdown.
/// Returns the process exit code.
fn supervise(kernel: &KernelHandles, cfg: &config::Config, shutdown: &AtomicBool) -> i32 {
    let tick = (cfg.watchdog_timeout() / 2).max(Duration::from_millis(10));
    let mut last_attest = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(tick);

        if let Some(code) = kernel
            .watchdog
            .supervise(&kernel.interlock, cfg.watchdog_policy)
        {
            println!(
                "{}",
                format!("  ✗ Watchdog: frozen context, exiting with {code}")
                    .red()
                    .bold()
            );
            return code;
        }

        if let Some(interval) = cfg.reattest_interval()
            && last_attest.elapsed() >= interval
        {
            kernel.refresh_trust();
            last_attest = Instant::now();
        }
    }
    0
}

/// Supervise the watchdog while the main thread is inside `bootstrap`.  A
/// hung boot under a terminating policy ends the process from here; the
/// emergency stop has already neutralised the actuators.
fn spawn_boot_watch(
    kernel: Arc<KernelHandles>,
    policy: FailurePolicy,
    booted: Arc<AtomicBool>,
) -> Option<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("boot-watch".to_string())
        .spawn(move || {
            while !booted.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
                if let Some(code) = kernel.watchdog.supervise(&kernel.interlock, policy) {
                    error!(code, "Bootstrap hung; exiting");
                    std::process::exit(code);
                }
            }
        })
        .map_err(|e| warn!(error = %e, "Failed to spawn boot watch; boot timeout unsupervised"))
        .ok()
}

fn neutralise(kernel: &KernelHandles) {
    if let Err(e) = kernel.bus.write_safe_state() {
        error!(error = %e, "Safe-state write failed");
    }
}

fn join_all(threads: Vec<thread::JoinHandle<()>>) {
    for h in threads {
        if h.join().is_err() {
            error!("Execution context panicked");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task ingress
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts routed tasks and logs them.  Motion planning lives above the
/// kernel.
struct ConsoleDispatcher;

impl TaskDispatcher for ConsoleDispatcher {
    fn dispatch(&self, task: &Task) -> Result<(), KernelError> {
        info!(task_id = %task.id, command = task.command.kind(), priority = task.priority, "Task dispatched");
        Ok(())
    }
}

/// One JSON task per line.  The reader thread is not joined; it ends with
/// the process.
fn spawn_stdin_router(router: Arc<CommandRouter>) {
    let spawned = thread::Builder::new()
        .name("stdin-router".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match router.route_json(&line) {
                    Ok(outcome) => println!("  {} {:?}", "→".green(), outcome),
                    Err(e) => println!("  {} {}", "✗".red(), e),
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to spawn stdin reader; task ingress disabled");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Console output
// ─────────────────────────────────────────────────────────────────────────────

async fn print_telemetry(mut rx: tokio::sync::mpsc::Receiver<TelemetryEvent>) {
    while let Some(event) = rx.recv().await {
        let at = chrono::Utc::now().format("%H:%M:%S%.3f");
        let line = match &event {
            TelemetryEvent::Trust {
                trust_score,
                mode,
                platform_class,
                ..
            } => format!(
                "trust {:.3} {} ({})",
                trust_score,
                colour_mode(mode.as_str(), *mode != OperationMode::ManualOnly),
                platform_class
            ),
            TelemetryEvent::Progress { stage, fraction } => {
                format!("boot {:>3.0}% {}", fraction * 100.0, stage.dimmed())
            }
            TelemetryEvent::Interlock { state, reason } => {
                format!("interlock {:?}: {}", state, reason).red().bold().to_string()
            }
            TelemetryEvent::Denied { subject, reason } => {
                format!("denied {}: {}", subject, reason).yellow().to_string()
            }
            TelemetryEvent::Spatial { lat, lng } => format!("goal {lat:.5}, {lng:.5}"),
            TelemetryEvent::Power { state, mode } => format!(
                "power {} ({})",
                colour_mode(state.as_str(), state.drives_actuators()),
                mode
            ),
        };
        println!("  {} {}", at.to_string().dimmed(), line);
    }
}

fn colour_mode(mode: &str, operable: bool) -> String {
    if operable {
        mode.green().bold().to_string()
    } else {
        mode.red().bold().to_string()
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"  ______                __  ______      __     "#.bold().cyan());
    println!("{}", r#" /_  __/______  _______/ /_/ ____/___ _/ /____ "#.bold().cyan());
    println!("{}", r#"  / / / ___/ / / / ___/ __/ / __/ __ `/ __/ _ \"#.bold().cyan());
    println!("{}", r#" / / / /  / /_/ (__  ) /_/ /_/ / /_/ / /_/  __/"#.bold().cyan());
    println!("{}", r#"/_/ /_/   \__,_/____/\__/\____/\__,_/\__/\___/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "TrustGate".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Trust-gated boot and actuation kernel");
    println!();
}
