/// The smoke check itself: launch the server, run the initialize handshake
/// and a tools/list query, surface everything observed on both streams,
/// and tear the process down on every exit path.
use crate::config::ProbeConfig;
use crate::mux::StreamTag;
use crate::probe::{ProbeError, ServerProcess};
use crate::rpc::{self, Reply};
use std::time::{Duration, Instant};

/// How a probe run ended.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Server exited during the startup grace period.
    EarlyExit { code: Option<i32> },
    /// No reply to the initialize handshake before its deadline.
    NoInitReply,
    /// Handshake answered, tools/list did not.
    NoToolsReply { init: Reply },
    /// Both requests answered.
    Complete { init: Reply, tools: Reply },
}

impl ProbeOutcome {
    /// Process exit code: 0 only when both requests were answered.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProbeOutcome::Complete { .. } => 0,
            _ => 1,
        }
    }
}

/// One transcript line on stdout, timestamped, unless quiet.
fn transcript(quiet: bool, prefix: &str, text: &str) {
    if !quiet {
        println!(
            "[{}] {} {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            prefix,
            text
        );
    }
}

/// Run the full smoke check. Stream-level trouble lands in the outcome;
/// only spawn and stdin-write failures surface as errors.
pub async fn run(config: &ProbeConfig, quiet: bool) -> Result<ProbeOutcome, ProbeError> {
    let timing = &config.timing;
    let mut server = ServerProcess::spawn(&config.server, timing.poll_quantum())?;

    transcript(
        quiet,
        "·",
        &format!("server started (pid {}), waiting for startup", server.pid()),
    );
    tokio::time::sleep(timing.startup_wait()).await;

    if let Some(status) = server.try_exit() {
        let code = status.code();
        tracing::warn!(code = ?code, "server exited during startup grace period");
        drain(&mut server, timing.poll_quantum(), quiet).await;
        transcript(quiet, "✗", &format!("server exited early with code {:?}", code));
        server.shutdown(timing.shutdown_grace()).await;
        return Ok(ProbeOutcome::EarlyExit { code });
    }

    // Surface any startup chatter before the first request.
    drain(&mut server, timing.poll_quantum(), quiet).await;

    let init_req = rpc::initialize_request(1);
    transcript(quiet, "→", &init_req.to_string());
    if let Err(e) = server.send(&init_req).await {
        server.shutdown(timing.shutdown_grace()).await;
        return Err(e);
    }

    let Some(init) = await_reply(&mut server, timing.init_timeout(), quiet).await else {
        transcript(quiet, "✗", "no reply to initialize before deadline");
        server.shutdown(timing.shutdown_grace()).await;
        return Ok(ProbeOutcome::NoInitReply);
    };
    transcript(quiet, "✓", "server replied to initialize");

    let list_req = rpc::tools_list_request(2);
    transcript(quiet, "→", &list_req.to_string());
    if let Err(e) = server.send(&list_req).await {
        server.shutdown(timing.shutdown_grace()).await;
        return Err(e);
    }

    let outcome = match await_reply(&mut server, timing.list_timeout(), quiet).await {
        Some(tools) => {
            transcript(quiet, "✓", "server replied to tools/list");
            ProbeOutcome::Complete { init, tools }
        }
        None => {
            transcript(quiet, "✗", "no reply to tools/list before deadline");
            ProbeOutcome::NoToolsReply { init }
        }
    };

    server.shutdown(timing.shutdown_grace()).await;
    Ok(outcome)
}

/// Poll until a decodable JSON-RPC response arrives on the primary stream or
/// the deadline passes. Diagnostic lines, notifications, and non-JSON
/// primary output are printed and polling continues.
async fn await_reply(server: &mut ServerProcess, timeout: Duration, quiet: bool) -> Option<Reply> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let event = server.mux.read_one(remaining).await?;
        match event.source {
            StreamTag::Primary => {
                let reply = rpc::classify(&event.text);
                if reply.is_response() {
                    transcript(quiet, "←", &event.text);
                    return Some(reply);
                }
                match reply {
                    Reply::Other(_) => {
                        transcript(quiet, "←", &format!("(notification) {}", event.text));
                    }
                    Reply::NonJson(text) => {
                        transcript(quiet, "←", &format!("(non-JSON) {}", text));
                    }
                    Reply::Result { .. } | Reply::Error { .. } => unreachable!(),
                }
            }
            StreamTag::Diagnostic => {
                transcript(quiet, "‹", &event.text);
            }
        }
    }
}

/// Overall budget for a drain pass, in quanta. A server that logs
/// continuously must not hold up the handshake.
const DRAIN_BUDGET_QUANTA: u32 = 5;

/// Print whatever is already buffered on either stream, stopping at the
/// first empty poll window or when the budget runs out, whichever is first.
async fn drain(server: &mut ServerProcess, quantum: Duration, quiet: bool) {
    let deadline = Instant::now() + quantum * DRAIN_BUDGET_QUANTA;
    while !server.mux.exhausted() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(event) = server.mux.read_one(remaining.min(quantum * 2)).await else {
            break;
        };
        let prefix = match event.source {
            StreamTag::Primary => "←",
            StreamTag::Diagnostic => "‹",
        };
        transcript(quiet, prefix, &event.text);
    }
}

/// Final human-readable verdict, mirroring the transcript's ✓/✗ style.
pub fn print_summary(outcome: &ProbeOutcome, quiet: bool) {
    if quiet {
        return;
    }
    match outcome {
        ProbeOutcome::EarlyExit { code } => {
            println!("✗ probe failed: server exited early (code {:?})", code);
        }
        ProbeOutcome::NoInitReply => {
            println!("✗ probe failed: initialize went unanswered");
        }
        ProbeOutcome::NoToolsReply { init } => {
            println!("✗ probe incomplete: initialize answered, tools/list unanswered");
            print_reply("initialize", init);
        }
        ProbeOutcome::Complete { init, tools } => {
            println!("✓ probe complete: both requests answered");
            print_reply("initialize", init);
            print_reply("tools/list", tools);
        }
    }
}

fn print_reply(label: &str, reply: &Reply) {
    match reply {
        Reply::Result { body, .. } => {
            let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
            println!("{} result:\n{}", label, pretty);
        }
        Reply::Error { body, .. } => {
            let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
            println!("{} returned an error:\n{}", label, pretty);
        }
        // await_reply only hands back responses.
        Reply::Other(_) | Reply::NonJson(_) => {}
    }
}
