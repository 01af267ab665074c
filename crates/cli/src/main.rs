mod report;
mod runner;

use anyhow::Context;
use bootcheck_config::TestScript;
use bootcheck_core::{verify_firmware_digest, FirmwareDigest, StreamSession, VerifyError};
use clap::{Args, Parser, Subcommand};
use report::{ResolvedConfig, TestResult};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const EXIT_PASS: i32 = 0;
const EXIT_ASSERT_FAIL: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_RUNTIME_ERROR: i32 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "BootCheck firmware boot verifier", long_about = None)]
struct Cli {
    /// Enable debug logging, including matched device output
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a digest prefix reported by the app against the firmware image
    Verify(VerifyArgs),
    /// Run a test script against captured or piped device output
    Test(TestArgs),
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Path to the firmware ELF file
    #[arg(short, long)]
    firmware: PathBuf,

    /// Hex digest prefix printed by the running app
    #[arg(short, long)]
    reported: String,
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Path to the test script (YAML)
    #[arg(short, long)]
    script: PathBuf,

    /// Device output to read; stdin when omitted or "-"
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Directory for result.json, junit.xml and device.log
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Also write the JUnit report to this path
    #[arg(long)]
    junit: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        Command::Verify(args) => run_verify(&args),
        Command::Test(args) => run_test(&args),
    };
    std::process::exit(code);
}

fn run_verify(args: &VerifyArgs) -> i32 {
    match verify_firmware_digest(&args.firmware, &args.reported) {
        Ok(()) => {
            println!("PASS: ELF file SHA256 matches {}", args.reported);
            EXIT_PASS
        }
        Err(e @ VerifyError::DigestMismatch { .. }) => {
            println!("FAIL: {}", e);
            EXIT_ASSERT_FAIL
        }
        Err(VerifyError::Io(e)) => {
            error!("Failed to read firmware {:?}: {}", args.firmware, e);
            EXIT_RUNTIME_ERROR
        }
    }
}

fn open_log(log: Option<&Path>) -> anyhow::Result<Box<dyn Read + Send>> {
    match log {
        Some(path) if path != Path::new("-") => {
            let f = std::fs::File::open(path)
                .with_context(|| format!("Failed to open device log {:?}", path))?;
            Ok(Box::new(f))
        }
        _ => Ok(Box::new(std::io::stdin())),
    }
}

fn run_test(args: &TestArgs) -> i32 {
    let started = Instant::now();

    info!("Loading test script: {:?}", args.script);
    let script = match TestScript::from_file(&args.script) {
        Ok(script) => script,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let firmware = script.firmware_path(&args.script);
    let firmware_hash = firmware.as_deref().and_then(|path| {
        FirmwareDigest::of_file(path)
            .map_err(|e| warn!("Cannot hash firmware {:?}: {}", path, e))
            .ok()
            .map(|digest| digest.hex())
    });
    if let Some(hash) = &firmware_hash {
        info!("Firmware SHA256: {}", hash);
    }

    let source = match open_log(args.log.as_deref()) {
        Ok(source) => source,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_RUNTIME_ERROR;
        }
    };

    let timeout = Duration::from_millis(script.limits.timeout_ms);
    let mut session = match StreamSession::spawn(source, timeout) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start device reader: {}", e);
            return EXIT_RUNTIME_ERROR;
        }
    };

    let outcomes = runner::run_cases(&script.cases, &mut session, firmware.as_deref());
    session.drain_available();

    let result = TestResult::new(
        outcomes,
        firmware_hash,
        started.elapsed().as_millis() as u64,
        ResolvedConfig {
            script: args.script.clone(),
            firmware,
            log: args.log.clone(),
            timeout_ms: script.limits.timeout_ms,
        },
    );

    for case in &result.cases {
        match &case.message {
            Some(message) => println!("{:<18} {:?}: {}", case.name, case.status, message),
            None => println!("{:<18} {:?}", case.name, case.status),
        }
    }

    if let Err(e) = write_artifacts(args, &result, session.transcript()) {
        error!("{:#}", e);
        return EXIT_RUNTIME_ERROR;
    }

    if result.passed() {
        EXIT_PASS
    } else {
        EXIT_ASSERT_FAIL
    }
}

fn write_artifacts(args: &TestArgs, result: &TestResult, transcript: &str) -> anyhow::Result<()> {
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
        result.write_json(&dir.join("result.json"))?;
        result.write_junit(&dir.join("junit.xml"))?;
        std::fs::write(dir.join("device.log"), transcript)
            .with_context(|| format!("Failed to write device log in {:?}", dir))?;
        info!("Artifacts written to {:?}", dir);
    }

    if let Some(path) = &args.junit {
        result.write_junit(path)?;
    }

    Ok(())
}
