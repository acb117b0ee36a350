//! Privilege Service (§4.8): orchestrates the Stage 1 pattern pre-filter and
//! the optional Stage 2 language-model escalation, redacts chain-of-thought
//! before it ever reaches the audit ledger, and appends exactly one
//! `PRIVILEGE_DECISION` entry per document.

pub mod policy;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ediscovery_ledger::{AuditSink, Details};
use ediscovery_model_adapter::{AdapterError, ReasoningAdapter};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

pub use policy::{Policy, PolicyError, RuleKind, Stage1Result};

const REASONING_SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("policy unavailable: {0}")]
    PolicyMissing(#[from] PolicyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    Dynamic,
}

/// The effort level actually used for one Stage-2 call, after resolving
/// `Dynamic` against the document's length and legal-term density.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveEffort {
    Low,
    Medium,
    High,
}

impl EffectiveEffort {
    fn as_str(&self) -> &'static str {
        match self {
            EffectiveEffort::Low => "low",
            EffectiveEffort::Medium => "medium",
            EffectiveEffort::High => "high",
        }
    }
}

/// Small fixed gazetteer used by the `Dynamic` complexity heuristic. Not
/// exhaustive — it only needs to separate "plainly simple" from "dense
/// legal prose" well enough to pick a reasoning tier.
const LEGAL_TERMS: &[&str] = &[
    "hereinafter", "whereas", "indemnify", "indemnification", "tortious", "covenant",
    "subpoena", "deposition", "litigation", "counsel", "privileged", "confidential",
    "jurisdiction", "plaintiff", "defendant", "statute", "liability", "arbitration",
];

/// Word count over 2000 or legal-term density over 2% escalates to `High`;
/// over 400 words or 0.5% density to `Medium`; otherwise `Low`. Thresholds
/// are a deliberate, documented choice (DESIGN.md), not derived from the
/// source material.
fn resolve_effort(configured: ReasoningEffort, text: &str) -> EffectiveEffort {
    match configured {
        ReasoningEffort::Low => EffectiveEffort::Low,
        ReasoningEffort::Medium => EffectiveEffort::Medium,
        ReasoningEffort::High => EffectiveEffort::High,
        ReasoningEffort::Dynamic => {
            let words: Vec<&str> = text.split_whitespace().collect();
            let word_count = words.len();
            let legal_hits = words
                .iter()
                .filter(|w| {
                    let lower = w.to_ascii_lowercase();
                    LEGAL_TERMS.iter().any(|term| lower.contains(term))
                })
                .count();
            let density = if word_count == 0 { 0.0 } else { legal_hits as f64 / word_count as f64 };

            if word_count > 2000 || density > 0.02 {
                EffectiveEffort::High
            } else if word_count > 400 || density > 0.005 {
                EffectiveEffort::Medium
            } else {
                EffectiveEffort::Low
            }
        }
    }
}

/// Opt-in storage of full (unredacted) model chain-of-thought, keyed by
/// `reasoning_hash` (§4.8: "an opt-in encrypted vault MAY store the full
/// reasoning"). Real encryption-at-rest is a deployment concern; this trait
/// is the seam a deployment wires a vault into.
pub trait ReasoningVault: Send + Sync {
    fn store(&self, reasoning_hash: &str, full_reasoning: &str);
}

/// In-memory vault: adequate for tests and single-process deployments that
/// don't need the full reasoning to survive a restart.
#[derive(Default)]
pub struct MemoryVault {
    entries: std::sync::Mutex<BTreeMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reasoning_hash: &str) -> Option<String> {
        self.entries.lock().expect("vault mutex poisoned").get(reasoning_hash).cloned()
    }
}

impl ReasoningVault for MemoryVault {
    fn store(&self, reasoning_hash: &str, full_reasoning: &str) {
        self.entries
            .lock()
            .expect("vault mutex poisoned")
            .insert(reasoning_hash.to_string(), full_reasoning.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct PrivilegeConfig {
    pub threshold_high: f64,
    pub threshold_low: f64,
    pub reasoning_effort: ReasoningEffort,
    pub log_full_cot: bool,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            threshold_high: 0.85,
            threshold_low: 0.50,
            reasoning_effort: ReasoningEffort::Dynamic,
            log_full_cot: false,
        }
    }
}

/// `doc_id` (= sha256), stage, labels, confidence, `needs_review`,
/// redacted reasoning, policy/model versions (§3 "Privilege Decision").
/// Produced once per document, appended to the ledger, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrivilegeDecision {
    pub doc_id: String,
    pub stage: u8,
    pub labels: Vec<String>,
    pub confidence: f64,
    pub needs_review: bool,
    pub reasoning_hash: Option<String>,
    pub reasoning_summary: Option<String>,
    pub policy_version: String,
    pub model_version: Option<String>,
    pub decision_ts: DateTime<Utc>,
}

/// Reduces a model's full chain-of-thought to what's safe to put in the
/// ledger (§4.8): a salted hash for tamper-evident reference, and a summary
/// with any line containing a quoted excerpt stripped, truncated to 200
/// characters.
pub fn redact_reasoning(full_reasoning: &str, policy_version: &str) -> (String, String) {
    let mut salted = full_reasoning.as_bytes().to_vec();
    salted.extend_from_slice(policy_version.as_bytes());
    let reasoning_hash = hex::encode(Sha256::digest(&salted));

    let filtered: String = full_reasoning
        .lines()
        .filter(|line| !line.contains('"') && !line.contains('\u{201c}') && !line.contains('\u{201d}'))
        .collect::<Vec<_>>()
        .join(" ");
    let summary: String = filtered.chars().take(REASONING_SUMMARY_MAX_CHARS).collect();

    (reasoning_hash, summary)
}

fn build_prompt(policy_text: &str, document_text: &str, effort: EffectiveEffort) -> String {
    format!(
        "POLICY:\n{policy_text}\n\nREASONING_EFFORT: {}\n\nDOCUMENT:\n{document_text}",
        effort.as_str()
    )
}

/// Orchestrates Stage 1 and (optionally) Stage 2 for one policy version.
pub struct PrivilegeService {
    policy: Policy,
    config: PrivilegeConfig,
    ledger: Arc<dyn AuditSink>,
    reasoning: Option<Arc<ReasoningAdapter>>,
    vault: Option<Arc<dyn ReasoningVault>>,
}

impl PrivilegeService {
    /// Refuses to start if `policy_path` is missing or unreadable
    /// (§7 `PolicyMissing`, fatal for this service only).
    pub fn from_policy_file(
        policy_path: impl AsRef<std::path::Path>,
        config: PrivilegeConfig,
        ledger: Arc<dyn AuditSink>,
    ) -> Result<Self, PrivilegeError> {
        let policy = Policy::load(policy_path)?;
        Ok(Self::new(policy, config, ledger))
    }

    pub fn new(policy: Policy, config: PrivilegeConfig, ledger: Arc<dyn AuditSink>) -> Self {
        Self { policy, config, ledger, reasoning: None, vault: None }
    }

    pub fn with_reasoning(mut self, adapter: Arc<ReasoningAdapter>) -> Self {
        self.reasoning = Some(adapter);
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn ReasoningVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn policy_version(&self) -> &str {
        self.policy.version()
    }

    /// Classifies one document. Pure function of `(text, policy_version,
    /// model_version, reasoning_effort)` for Stage-1-only outcomes; Stage-2
    /// outcomes are guaranteed only to land in the same confidence band on
    /// rerun (§4.8 "Determinism and auditability").
    pub fn classify(&self, doc_id: &str, text: &str) -> PrivilegeDecision {
        let stage1 = self.policy.scan(text);

        if stage1.nonprivileged && stage1.labels.is_empty() {
            return self.record(doc_id, 1, vec!["RESPONSIVE".to_string()], 1.0, false, None, None, None);
        }

        if stage1.confidence >= self.config.threshold_high {
            return self.record(doc_id, 1, stage1.labels, stage1.confidence, false, None, None, None);
        }

        if stage1.confidence < self.config.threshold_low {
            return self.record(doc_id, 1, stage1.labels, stage1.confidence, true, None, None, None);
        }

        match &self.reasoning {
            Some(adapter) => self.escalate(doc_id, text, adapter),
            None => self.record(doc_id, 1, stage1.labels, stage1.confidence, true, None, None, None),
        }
    }

    fn escalate(&self, doc_id: &str, text: &str, adapter: &Arc<ReasoningAdapter>) -> PrivilegeDecision {
        let effort = resolve_effort(self.config.reasoning_effort, text);
        let prompt = build_prompt(self.policy.text(), text, effort);

        match adapter.reason(&prompt) {
            Ok(raw) => {
                let (reasoning_hash, reasoning_summary) = redact_reasoning(&raw.full_reasoning, self.policy.version());
                if self.config.log_full_cot {
                    if let Some(vault) = &self.vault {
                        vault.store(&reasoning_hash, &raw.full_reasoning);
                    }
                }
                let needs_review = raw.confidence < self.config.threshold_high;
                let mut labels = raw.labels;
                labels.sort();
                info!(doc_id, confidence = raw.confidence, "stage-2 decision recorded");
                self.record(
                    doc_id,
                    2,
                    labels,
                    raw.confidence,
                    needs_review,
                    Some(reasoning_hash),
                    Some(reasoning_summary),
                    Some(raw.model_version),
                )
            }
            Err(err) => {
                warn!(doc_id, error = %degrade_reason(&err), "stage-2 escalation failed, degrading");
                self.record(
                    doc_id,
                    2,
                    Vec::new(),
                    0.0,
                    true,
                    None,
                    Some("backend unavailable".to_string()),
                    None,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        doc_id: &str,
        stage: u8,
        labels: Vec<String>,
        confidence: f64,
        needs_review: bool,
        reasoning_hash: Option<String>,
        reasoning_summary: Option<String>,
        model_version: Option<String>,
    ) -> PrivilegeDecision {
        let decision = PrivilegeDecision {
            doc_id: doc_id.to_string(),
            stage,
            labels: labels.clone(),
            confidence,
            needs_review,
            reasoning_hash: reasoning_hash.clone(),
            reasoning_summary: reasoning_summary.clone(),
            policy_version: self.policy.version().to_string(),
            model_version: model_version.clone(),
            decision_ts: Utc::now(),
        };

        let mut details = Details::new();
        details.insert("doc_id".to_string(), JsonValue::String(doc_id.to_string()));
        details.insert("stage".to_string(), JsonValue::from(stage));
        details.insert(
            "labels".to_string(),
            JsonValue::Array(labels.into_iter().map(JsonValue::String).collect()),
        );
        details.insert(
            "confidence".to_string(),
            serde_json::Number::from_f64(confidence).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        );
        details.insert("needs_review".to_string(), JsonValue::Bool(needs_review));
        if let Some(hash) = &reasoning_hash {
            details.insert("reasoning_hash".to_string(), JsonValue::String(hash.clone()));
        }
        if let Some(summary) = &reasoning_summary {
            details.insert("reasoning_summary".to_string(), JsonValue::String(summary.clone()));
        }
        details.insert("policy_version".to_string(), JsonValue::String(self.policy.version().to_string()));
        if let Some(model_version) = &model_version {
            details.insert("model_version".to_string(), JsonValue::String(model_version.clone()));
        }

        if let Err(e) = self.ledger.append("PRIVILEGE_DECISION", details) {
            warn!(doc_id, error = %e, "failed to append PRIVILEGE_DECISION");
        }
        decision
    }
}

fn degrade_reason(err: &AdapterError) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ediscovery_ledger::AuditLedger;
    use ediscovery_model_adapter::{AdapterConfig, RawReasoningResponse, ReasoningClient};
    use std::time::Duration;
    use tempfile::TempDir;

    const POLICY: &str = "\
PRIVILEGED:ACP | domain | lawfirm.com | 0.6
PRIVILEGED:ACP | phrase | privileged and confidential | 0.5
PRIVILEGED:WP | phrase | attorney work product | 0.9
RESPONSIVE | nonprivileged | public filing | 1.0
";

    fn service(config: PrivilegeConfig) -> (PrivilegeService, Arc<AuditLedger>) {
        let tmp = TempDir::new().unwrap().into_path();
        let ledger = Arc::new(AuditLedger::open(tmp.join("audit.jsonl")).unwrap());
        let policy = Policy::compile(POLICY.to_string()).unwrap();
        (PrivilegeService::new(policy, config, ledger.clone()), ledger)
    }

    #[test]
    fn stage1_hit_is_final_no_escalation() {
        let (service, ledger) = service(PrivilegeConfig::default());
        let decision = service.classify(
            "deadbeef",
            "From: counsel@lawfirm.com\n\nThis is privileged and confidential.",
        );
        assert_eq!(decision.stage, 1);
        assert_eq!(decision.labels, vec!["PRIVILEGED:ACP".to_string()]);
        assert!(decision.confidence >= 0.85);
        assert!(!decision.needs_review);
        assert_eq!(ledger.entry_count(), 1);
    }

    #[test]
    fn conclusively_nonprivileged_is_responsive() {
        let (service, _ledger) = service(PrivilegeConfig::default());
        let decision = service.classify("cafebabe", "This is a public filing with the SEC.");
        assert_eq!(decision.labels, vec!["RESPONSIVE".to_string()]);
        assert_eq!(decision.confidence, 1.0);
        assert!(!decision.needs_review);
    }

    #[test]
    fn low_confidence_without_escalation_needs_review() {
        let (service, _ledger) = service(PrivilegeConfig::default());
        let decision = service.classify("aaaa", "An entirely unremarkable internal memo.");
        assert_eq!(decision.stage, 1);
        assert!(decision.needs_review);
    }

    struct SpyClient {
        invoked: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }
    impl ReasoningClient for SpyClient {
        fn reason(&self, _prompt: &str, _timeout: Duration) -> Result<RawReasoningResponse, AdapterError> {
            self.invoked.store(true, std::sync::atomic::Ordering::SeqCst);
            Err(AdapterError::Network("unreachable in test".into()))
        }
    }

    #[test]
    fn stage2_escalation_under_open_breaker_degrades_without_dispatch() {
        let mut config = PrivilegeConfig::default();
        config.threshold_low = 0.0; // force every non-final doc into the escalation band
        let (mut service, ledger) = service(config);

        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let client = std::sync::Arc::new(SpyClient { invoked: invoked.clone() });
        let adapter_config = AdapterConfig {
            online_mode: true,
            breaker_failure_threshold: 1,
            breaker_cooldown: Duration::from_secs(3600),
            ..Default::default()
        };
        let adapter = Arc::new(ReasoningAdapter::new(client, adapter_config));
        // Trip the breaker first so it is already OPEN when classify() runs.
        let _ = adapter.reason("warm up");
        assert_eq!(adapter.breaker_state(), ediscovery_model_adapter::BreakerState::Open);
        invoked.store(false, std::sync::atomic::Ordering::SeqCst);

        service = service.with_reasoning(adapter.clone());
        let decision = service.classify("feedface", "An ambiguous memo mentioning counsel in passing.");

        assert_eq!(decision.stage, 2);
        assert!(decision.needs_review);
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(decision.reasoning_summary.as_deref(), Some("backend unavailable"));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst), "breaker must short-circuit the call");
        assert_eq!(ledger.entry_count(), 1);
    }

    #[test]
    fn reasoning_redaction_never_leaks_long_quoted_substrings() {
        let full_reasoning = "The document says \"this settlement amount is confidential per agreement\" which suggests privilege.";
        let (hash, summary) = redact_reasoning(full_reasoning, "policyv1");
        assert_eq!(hash.len(), 64);
        assert!(!summary.contains("settlement amount is confidential"));
    }

    #[test]
    fn dynamic_effort_escalates_with_density_and_length() {
        let short = "ok fine yes";
        assert_eq!(resolve_effort(ReasoningEffort::Dynamic, short), EffectiveEffort::Low);

        let dense = "whereas tortious indemnification covenant subpoena deposition litigation";
        assert_eq!(resolve_effort(ReasoningEffort::Dynamic, dense), EffectiveEffort::High);
    }

    proptest::proptest! {
        #[test]
        fn stage1_only_decisions_are_deterministic(seed in 0u64..50) {
            let (service, _ledger) = service(PrivilegeConfig::default());
            let text = format!("memo number {seed} with no privilege markers");
            let a = service.classify("x", &text);
            let b = service.classify("x", &text);
            proptest::prop_assert_eq!(a.labels, b.labels);
            proptest::prop_assert_eq!(a.confidence, b.confidence);
            proptest::prop_assert_eq!(a.needs_review, b.needs_review);
        }
    }
}
