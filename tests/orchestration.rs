//! End-to-end orchestration tests against a scripted stub client

use kairos::{
    ChatClient, ChatRequest, ChatResponse, Error, ModelCatalog, ModelConfig, Orchestrator,
    OrchestratorConfig, PromptTokensDetails, TokenUsage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const MODEL: &str = "test-model";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn catalog() -> ModelCatalog {
    let mut models = HashMap::new();
    models.insert(
        MODEL.to_string(),
        ModelConfig {
            input: 1.0,
            output: 2.0,
            cache: 0.0,
            json_schema: true,
        },
    );
    ModelCatalog::new(models)
}

fn ok_response(prompt_tokens: u64, completion_tokens: u64) -> ChatResponse {
    ChatResponse {
        content: "ok".to_string(),
        usage: TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: None,
        },
    }
}

/// Stub client scripted per prompt text and per-text attempt number
struct StubClient {
    calls: AtomicU64,
    attempts: Mutex<HashMap<String, u32>>,
    script: Box<dyn Fn(&str, u32) -> Result<ChatResponse, Error> + Send + Sync>,
}

impl StubClient {
    fn new(
        script: impl Fn(&str, u32) -> Result<ChatResponse, Error> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
            attempts: Mutex::new(HashMap::new()),
            script: Box::new(script),
        })
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChatClient for StubClient {
    async fn submit(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(text.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        (self.script)(&text, attempt)
    }
}

fn orchestrator_with(client: Arc<StubClient>, max_tpm: u64) -> Orchestrator {
    Orchestrator::new(
        client as Arc<dyn ChatClient>,
        catalog(),
        OrchestratorConfig::new(MODEL, max_tpm),
    )
    .unwrap()
}

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn happy_path_small_batch() {
    init_tracing();
    let client = StubClient::new(|_, _| Ok(ok_response(100, 50)));
    let orchestrator = orchestrator_with(Arc::clone(&client), 60_000);

    let output = orchestrator
        .process_batch(&texts(&["a", "b", "c"]), "{text}", None, None, None, &HashMap::new())
        .await
        .unwrap();

    assert_eq!(output.results.len(), 3);
    assert!(output.results.iter().all(|outcome| outcome.success));
    assert_eq!(client.call_count(), 3);

    // results come back in input order with synthesized ids
    for (index, outcome) in output.results.iter().enumerate() {
        assert_eq!(outcome.id, format!("{}_req_{index}", output.batch_id));
        assert_eq!(outcome.input_tokens, Some(100));
        assert_eq!(outcome.output_tokens, Some(50));
        assert_eq!(outcome.total_tokens, Some(150));
        assert!((outcome.cost.unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(outcome.attempts, 1);
    }

    // batch container closed with consistent counters and cost
    let stats = &output.batch_stats;
    assert!(stats.end_time.is_some());
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.successful_requests, 3);
    assert_eq!(stats.failed_requests, 0);
    assert!((stats.total_cost - 0.60).abs() < 1e-9);
    assert!(stats.concurrent_peak <= 3);
    assert!(stats.peak_tpm <= 450);

    settle().await;
    let global = orchestrator.stats_manager().global_snapshot().await;
    assert_eq!(global.total_requests, 3);
    assert_eq!(global.peak_tpm, 450);
    assert_eq!(global.current_concurrent_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_pushback_recovers_on_retry() {
    init_tracing();
    let client = StubClient::new(|text, attempt| {
        if text == "b" && attempt == 1 {
            Err(Error::Api {
                message: "token rate limit; try again in 2s".to_string(),
                retry_after: None,
            })
        } else {
            Ok(ok_response(100, 50))
        }
    });
    let orchestrator = orchestrator_with(Arc::clone(&client), 60_000);

    let output = orchestrator
        .process_batch(&texts(&["a", "b", "c"]), "{text}", None, None, None, &HashMap::new())
        .await
        .unwrap();

    assert_eq!(output.results.iter().filter(|o| o.success).count(), 3);
    assert_eq!(output.results[1].attempts, 2);
    assert_eq!(output.results[0].attempts, 1);
    assert_eq!(output.batch_stats.retry_count, 1);

    settle().await;
    let global = orchestrator.stats_manager().global_snapshot().await;
    assert_eq!(global.api_rate_limits_detected, 1);

    // emergency tune halved the initial concurrency, staying above the floor
    let concurrency = orchestrator.limiter().current_concurrency().await;
    assert_eq!(concurrency, 5);
    assert!(concurrency >= 2);
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_exhausts_retry_budget() {
    init_tracing();
    let client = StubClient::new(|text, _| {
        if text == "a" {
            Err(Error::Api {
                message: "boom".to_string(),
                retry_after: None,
            })
        } else {
            Ok(ok_response(100, 50))
        }
    });
    let orchestrator = orchestrator_with(Arc::clone(&client), 60_000);

    let output = orchestrator
        .process_batch(&texts(&["a", "b", "c"]), "{text}", None, None, None, &HashMap::new())
        .await
        .unwrap();

    let failed = &output.results[0];
    assert!(!failed.success);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.error_type(), "RetryError");
    assert_eq!(failed.error.as_deref(), Some("api error: boom"));
    let details = failed.error_details.as_ref().unwrap();
    assert!(details.message.contains("failed after 3 attempts"));

    assert!(output.results[1].success);
    assert!(output.results[2].success);
    assert_eq!(output.batch_stats.failed_requests, 1);
    assert_eq!(output.batch_stats.successful_requests, 2);
    assert_eq!(
        output.batch_stats.error_type_counts.get("RetryError"),
        Some(&1)
    );
    // all failures are reported through outcomes, never by aborting the batch
    assert_eq!(output.results.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn json_schema_incompatibility_fails_before_any_call() {
    init_tracing();
    let client = StubClient::new(|_, _| Ok(ok_response(100, 50)));
    let mut models = HashMap::new();
    models.insert(
        MODEL.to_string(),
        ModelConfig {
            input: 1.0,
            output: 2.0,
            cache: 0.0,
            json_schema: false,
        },
    );
    let orchestrator = Orchestrator::new(
        Arc::clone(&client) as Arc<dyn ChatClient>,
        ModelCatalog::new(models),
        OrchestratorConfig::new(MODEL, 60_000),
    )
    .unwrap();

    let schema = serde_json::json!({"type": "object"});
    let single = orchestrator
        .process_single("hello", "{text}", Some(&schema), None, &HashMap::new())
        .await;
    assert!(matches!(single, Err(Error::SchemaUnsupported { .. })));

    let batch = orchestrator
        .process_batch(&texts(&["hello"]), "{text}", Some(&schema), None, None, &HashMap::new())
        .await;
    assert!(matches!(batch, Err(Error::SchemaUnsupported { .. })));

    assert_eq!(client.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn json_mode_keeps_raw_content_on_parse_failure() {
    init_tracing();
    let client = StubClient::new(|text, _| {
        let mut response = ok_response(100, 50);
        response.content = if text == "valid" {
            r#"{"label": "spam"}"#.to_string()
        } else {
            "not json at all".to_string()
        };
        Ok(response)
    });
    let orchestrator = orchestrator_with(client, 60_000);
    let schema = serde_json::json!({"type": "object"});

    let parsed_ok = orchestrator
        .process_single("valid", "{text}", Some(&schema), None, &HashMap::new())
        .await
        .unwrap();
    assert!(parsed_ok.success);
    assert_eq!(parsed_ok.parsed.as_ref().unwrap()["label"], "spam");

    let parse_failed = orchestrator
        .process_single("broken", "{text}", Some(&schema), None, &HashMap::new())
        .await
        .unwrap();
    // a parse failure is not an error: raw content survives
    assert!(parse_failed.success);
    assert!(parse_failed.parsed.is_none());
    assert_eq!(parse_failed.content.as_deref(), Some("not json at all"));
}

#[tokio::test(start_paused = true)]
async fn cached_tokens_reduce_billed_input() {
    init_tracing();
    let client = StubClient::new(|_, _| {
        Ok(ChatResponse {
            content: "ok".to_string(),
            usage: TokenUsage {
                prompt_tokens: 1000,
                completion_tokens: 0,
                total_tokens: 1000,
                prompt_tokens_details: Some(PromptTokensDetails { cached_tokens: 400 }),
            },
        })
    });
    let mut models = HashMap::new();
    models.insert(
        MODEL.to_string(),
        ModelConfig {
            input: 1.0,
            output: 2.0,
            cache: 0.25,
            json_schema: true,
        },
    );
    let orchestrator = Orchestrator::new(
        client as Arc<dyn ChatClient>,
        ModelCatalog::new(models),
        OrchestratorConfig::new(MODEL, 60_000),
    )
    .unwrap();

    let outcome = orchestrator
        .process_single("hello", "{text}", None, None, &HashMap::new())
        .await
        .unwrap();
    assert_eq!(outcome.cached_tokens, Some(400));
    // 600/1000*1.0 + 400/1000*0.25 = 0.7
    assert!((outcome.cost.unwrap() - 0.7).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn empty_batch_returns_closed_container() {
    init_tracing();
    let client = StubClient::new(|_, _| Ok(ok_response(100, 50)));
    let orchestrator = orchestrator_with(Arc::clone(&client), 60_000);

    let output = orchestrator
        .process_batch(&[], "{text}", None, None, None, &HashMap::new())
        .await
        .unwrap();

    assert!(output.results.is_empty());
    assert_eq!(output.batch_stats.total_requests, 0);
    assert!(output.batch_stats.end_time.is_some());
    assert_eq!(client.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn custom_ids_length_mismatch_raises_before_work_starts() {
    init_tracing();
    let client = StubClient::new(|_, _| Ok(ok_response(100, 50)));
    let orchestrator = orchestrator_with(Arc::clone(&client), 60_000);

    let ids = vec![Some("only-one".to_string())];
    let result = orchestrator
        .process_batch(
            &texts(&["a", "b"]),
            "{text}",
            None,
            None,
            Some(&ids),
            &HashMap::new(),
        )
        .await;

    match result {
        Err(Error::InvalidCustomIds { expected, got }) => {
            assert_eq!(expected, 2);
            assert_eq!(got, 1);
        }
        other => panic!("expected InvalidCustomIds, got {other:?}"),
    }
    assert_eq!(client.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn process_single_records_into_global_scope_only() {
    init_tracing();
    let client = StubClient::new(|_, _| Ok(ok_response(100, 50)));
    let orchestrator = orchestrator_with(client, 60_000);

    let outcome = orchestrator
        .process_single("hello", "classify: {text}", None, Some("my-id"), &HashMap::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.id, "my-id");

    let global = orchestrator.stats_manager().global_snapshot().await;
    assert_eq!(global.total_requests, 1);
    assert_eq!(global.concurrent_peak, 1);
    assert_eq!(global.current_concurrent_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn template_vars_reach_the_client() {
    init_tracing();
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_clone = Arc::clone(&seen);
    let client = StubClient::new(move |text, _| {
        *seen_clone.lock().unwrap() = text.to_string();
        Ok(ok_response(10, 5))
    });
    let orchestrator = orchestrator_with(client, 60_000);

    let mut vars = HashMap::new();
    vars.insert("lang".to_string(), "pt".to_string());
    orchestrator
        .process_single("olá", "translate to {lang}: {text}", None, None, &vars)
        .await
        .unwrap();

    assert_eq!(&*seen.lock().unwrap(), "translate to pt: olá");
}

#[tokio::test(start_paused = true)]
async fn batch_summary_is_available_after_close() {
    init_tracing();
    let client = StubClient::new(|_, _| Ok(ok_response(100, 50)));
    let orchestrator = orchestrator_with(client, 60_000);

    let output = orchestrator
        .process_batch(&texts(&["a", "b"]), "{text}", None, Some("report"), None, &HashMap::new())
        .await
        .unwrap();

    let summary = orchestrator
        .stats_manager()
        .get_summary(Some(&output.batch_id))
        .await;
    assert!(summary.contains(&output.batch_id));
    assert!(summary.contains("2 total | 2 succeeded | 0 failed"));

    let unknown = orchestrator.stats_manager().get_summary(Some("ghost")).await;
    assert!(unknown.contains("no statistics"));
}
