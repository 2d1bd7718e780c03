//! Prometheus metrics for the agent engine
//!
//! Collectors register with the default registry on first use. Call [`init`]
//! at startup so every series shows up in the first scrape.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished runs by terminal status.
    ///
    /// Labels:
    /// - status: "done", "error" or "cancelled"
    pub static ref AGENT_RUNS: IntCounterVec = register_int_counter_vec!(
        "agentvisor_agent_runs_total",
        "Agent runs by terminal status",
        &["status"]
    ).expect("failed to register AGENT_RUNS metric");

    /// Model iterations used per run.
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "agentvisor_agent_iterations",
        "Model iterations per agent run",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0]
    ).expect("failed to register AGENT_ITERATIONS metric");

    /// Wall time of one model call including hook wrappers and retries.
    ///
    /// Labels:
    /// - model: model identifier reported by the client
    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "agentvisor_model_call_duration_seconds",
        "Model call duration",
        &["model"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register MODEL_CALL_DURATION metric");

    /// Tool calls by tool name and outcome.
    ///
    /// Labels:
    /// - tool: tool name as requested by the model
    /// - status: "ok", "error" or "unavailable"
    pub static ref TOOL_CALLS: IntCounterVec = register_int_counter_vec!(
        "agentvisor_tool_calls_total",
        "Tool calls by tool and outcome",
        &["tool", "status"]
    ).expect("failed to register TOOL_CALLS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Fast-path protocol attempts by outcome.
    ///
    /// Labels:
    /// - outcome: "ok", "failed" or "skipped" (skipped while degraded)
    pub static ref SANDBOX_FAST_PATH: IntCounterVec = register_int_counter_vec!(
        "agentvisor_sandbox_fast_path_total",
        "Sandbox protocol fast-path attempts by outcome",
        &["outcome"]
    ).expect("failed to register SANDBOX_FAST_PATH metric");

    /// Calls served through the container-exec fallback.
    ///
    /// Labels:
    /// - op: protocol operation name
    pub static ref SANDBOX_FALLBACKS: IntCounterVec = register_int_counter_vec!(
        "agentvisor_sandbox_fallbacks_total",
        "Sandbox calls served by the container-exec fallback",
        &["op"]
    ).expect("failed to register SANDBOX_FALLBACKS metric");

    /// Sandboxes currently tracked by the manager.
    pub static ref SANDBOXES_ACTIVE: IntGauge = register_int_gauge!(
        "agentvisor_sandboxes_active",
        "Sandboxes tracked by the sandbox manager"
    ).expect("failed to register SANDBOXES_ACTIVE metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Thread Store Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref THREADS_ACTIVE: IntGauge = register_int_gauge!(
        "agentvisor_threads_active",
        "Threads held in the thread store"
    ).expect("failed to register THREADS_ACTIVE metric");

    /// Threads removed by the idle sweep.
    pub static ref THREADS_EVICTED: IntCounter = register_int_counter!(
        "agentvisor_threads_evicted_total",
        "Threads evicted after exceeding the idle TTL"
    ).expect("failed to register THREADS_EVICTED metric");
}

/// Touch every collector so it is present in the registry before first use.
pub fn init() {
    lazy_static::initialize(&AGENT_RUNS);
    lazy_static::initialize(&AGENT_ITERATIONS);
    lazy_static::initialize(&MODEL_CALL_DURATION);
    lazy_static::initialize(&TOOL_CALLS);
    lazy_static::initialize(&SANDBOX_FAST_PATH);
    lazy_static::initialize(&SANDBOX_FALLBACKS);
    lazy_static::initialize(&SANDBOXES_ACTIVE);
    lazy_static::initialize(&THREADS_ACTIVE);
    lazy_static::initialize(&THREADS_EVICTED);
}

/// Render the default registry in the text exposition format.
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_series() {
        init();
        AGENT_RUNS.with_label_values(&["done"]).inc();
        let text = encode();
        assert!(text.contains("agentvisor_agent_runs_total"));
    }
}
