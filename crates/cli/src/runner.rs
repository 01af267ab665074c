use crate::report::{CaseOutcome, CaseStatus};
use bootcheck_config::TestCase;
use bootcheck_core::cases::{self, DEFAULT_GREETING};
use bootcheck_core::DeviceSession;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};

/// Runs the script's cases in order against one session. Once a case fails
/// the device output is in an unknown position, so the rest are skipped.
pub fn run_cases(
    cases: &[TestCase],
    session: &mut dyn DeviceSession,
    firmware: Option<&Path>,
) -> Vec<CaseOutcome> {
    let mut outcomes = Vec::with_capacity(cases.len());
    let mut failed = false;

    for case in cases {
        if failed {
            warn!("Skipping {} after earlier failure", case.name());
            outcomes.push(CaseOutcome::skipped(case.name()));
            continue;
        }

        let outcome = run_case(case, session, firmware);
        if outcome.status == CaseStatus::Fail {
            failed = true;
        }
        outcomes.push(outcome);
    }

    outcomes
}

fn run_case(case: &TestCase, session: &mut dyn DeviceSession, firmware: Option<&Path>) -> CaseOutcome {
    let name = case.name();
    let greeting = case.greeting().unwrap_or(DEFAULT_GREETING);
    let started = Instant::now();
    let mut outcome = CaseOutcome::new(name);

    info!("Running {}", name);

    let result = match case {
        TestCase::HelloWorld(_) => case
            .min_free_heap_bytes()
            .map_err(|e| e.to_string())
            .and_then(|min| {
                cases::hello_world(session, greeting, min).map_err(|e| e.to_string())
            })
            .map(|report| outcome.heap_free_bytes = Some(report.free_bytes)),
        TestCase::HelloWorldHost(_) => match firmware {
            Some(path) => cases::hello_world_host(session, path, greeting)
                .map(|reported| outcome.reported_sha256 = Some(reported))
                .map_err(|e| e.to_string()),
            None => Err("No firmware configured for digest check".to_string()),
        },
    };

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => {
            info!("{} passed", name);
            outcome.status = CaseStatus::Pass;
        }
        Err(message) => {
            error!("{} failed: {}", name, message);
            outcome.status = CaseStatus::Fail;
            outcome.message = Some(message);
        }
    }

    outcome
}
