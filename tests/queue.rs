use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use scene_narrator::config::RateLimitConfig;
use scene_narrator::detection::BoundingBox;
use scene_narrator::formatter::{CommentaryFormatter, DescriptionRequest, fallback_description};
use scene_narrator::provider::{Completion, DescriptionProvider, OpenAiRateLimitPolicy, ProviderError};
use scene_narrator::queue::{DescriptionQueue, RATE_LIMITED_MESSAGE};
use scene_narrator::scene::{
    Depth, HorizontalZone, MotionLabel, PersonAnnotation, PersonInfo, PoseLabel, PositionLabel, SceneDescriptor,
};

/// Plays back scripted results, then succeeds with numbered descriptions.
struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    calls: Mutex<Vec<Duration>>,
    prompts: Mutex<Vec<String>>,
    started: Instant,
}

impl ScriptedProvider {
    fn new(script: Vec<Result<Completion, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            started: Instant::now(),
        })
    }

    fn call_offsets_ms(&self) -> Vec<u128> {
        self.calls.lock().iter().map(|d| d.as_millis()).collect()
    }
}

#[async_trait]
impl DescriptionProvider for ScriptedProvider {
    async fn describe(&self, request: &DescriptionRequest) -> Result<Completion, ProviderError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(self.started.elapsed());
            calls.len()
        };
        self.prompts.lock().push(request.prompt.clone());
        self.script.lock().pop_front().unwrap_or_else(|| {
            Ok(Completion {
                text: format!("description {}", call),
                completion_tokens: Some(10),
            })
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn ok(text: &str, tokens: u32) -> Result<Completion, ProviderError> {
    Ok(Completion {
        text: text.to_string(),
        completion_tokens: Some(tokens),
    })
}

fn rate_limited() -> Result<Completion, ProviderError> {
    Err(ProviderError::Http {
        status: 429,
        body: r#"{"error":{"code":"rate_limit_exceeded"}}"#.to_string(),
    })
}

fn queue_with(provider: Option<Arc<ScriptedProvider>>) -> DescriptionQueue {
    DescriptionQueue::spawn(
        &RateLimitConfig::default(),
        CommentaryFormatter::new("Describe the scene.", "Describe the scenery."),
        5,
        provider.map(|p| p as Arc<dyn DescriptionProvider>),
        Arc::new(OpenAiRateLimitPolicy),
    )
}

fn scene(age: &str, expression: &str) -> SceneDescriptor {
    SceneDescriptor {
        people: vec![PersonInfo {
            pose: PoseLabel::Sitting,
            position: PositionLabel {
                horizontal: HorizontalZone::Center,
                depth: Depth::Background,
            },
            activity: None,
            movement: MotionLabel::StandingStill,
            annotation: PersonAnnotation {
                age_range: age.to_string(),
                expression: expression.to_string(),
                confidence: 0.8,
                alert: None,
            },
            bbox: BoundingBox::new(100.0, 100.0, 90.0, 100.0),
        }],
        objects: vec!["laptop".to_string()],
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_dispatches_in_order_with_minimum_spacing() {
    let provider = ScriptedProvider::new(Vec::new());
    let queue = queue_with(Some(provider.clone()));

    let a = queue.enqueue(scene("20-25", "happy"));
    let b = queue.enqueue(scene("30-35", "neutral"));
    let c = queue.enqueue(scene("40-45", "sad"));
    let (a, b, c) = tokio::join!(a, b, c);

    assert_eq!(a, "description 1");
    assert_eq!(b, "description 2");
    assert_eq!(c, "description 3");
    assert_eq!(provider.call_offsets_ms(), vec![0, 1000, 2000]);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_task_retries_before_later_tasks() {
    let provider = ScriptedProvider::new(vec![rate_limited(), rate_limited(), ok("first", 10)]);
    let queue = queue_with(Some(provider.clone()));

    let a = queue.enqueue(scene("20-25", "happy"));
    let b = queue.enqueue(scene("30-35", "neutral"));
    let c = queue.enqueue(scene("40-45", "sad"));
    let (a, b, c) = tokio::join!(a, b, c);

    assert_eq!(a, "first");
    assert_eq!(b, "description 4");
    assert_eq!(c, "description 5");
    // Backoff waits of 1s and 2s, then spacing for the tasks behind it.
    assert_eq!(provider.call_offsets_ms(), vec![0, 1000, 3000, 4000, 5000]);

    let stats = queue.stats();
    assert_eq!(stats.backoff_waits, 2);
    assert_eq!(stats.dispatched, 5);
    assert_eq!(stats.succeeded, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_holds_dispatch_until_window_resets() {
    // The first completion alone pushes usage past 80% of 10k tokens.
    let provider = ScriptedProvider::new(vec![ok("busy scene", 8_500)]);
    let queue = queue_with(Some(provider.clone()));

    let first = queue.enqueue(scene("20-25", "happy")).await;
    assert_eq!(first, "busy scene");
    assert!(queue.stats().tokens_used > 8_000);

    let second = queue.enqueue(scene("30-35", "neutral")).await;
    assert_eq!(second, "description 2");
    assert_eq!(provider.call_offsets_ms(), vec![0, 60_000]);
    assert_eq!(queue.stats().cooldowns, 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_provider_means_local_descriptions_only() {
    let start = Instant::now();
    let queue = queue_with(None);

    let scenes = [scene("20-25", "happy"), scene("30-35", "neutral"), SceneDescriptor::default()];
    for descriptor in scenes {
        let expected = fallback_description(&descriptor);
        assert_eq!(queue.enqueue(descriptor).await, expected);
    }

    let stats = queue.stats();
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.degraded, 3);
    assert!(start.elapsed() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_other_failures_degrade_without_retry() {
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::Timeout),
        Err(ProviderError::Http {
            status: 500,
            body: "upstream failure".to_string(),
        }),
        Err(ProviderError::Malformed("expected value".to_string())),
    ]);
    let queue = queue_with(Some(provider.clone()));

    for (age, expression) in [("20-25", "happy"), ("30-35", "neutral"), ("40-45", "sad")] {
        let descriptor = scene(age, expression);
        let expected = fallback_description(&descriptor);
        let text = queue.enqueue(descriptor).await;
        assert_eq!(text, expected);
        assert!(text.contains(age) && text.contains(expression));
    }

    assert_eq!(provider.call_offsets_ms().len(), 3);
    let stats = queue.stats();
    assert_eq!(stats.degraded, 3);
    assert_eq!(stats.backoff_waits, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_resolve_with_rate_limit_message() {
    let provider = ScriptedProvider::new(vec![rate_limited(), rate_limited(), rate_limited(), rate_limited()]);
    let queue = queue_with(Some(provider.clone()));

    let text = queue.enqueue(scene("20-25", "happy")).await;
    assert_eq!(text, RATE_LIMITED_MESSAGE);
    assert_eq!(provider.call_offsets_ms(), vec![0, 1000, 3000, 7000]);

    let stats = queue.stats();
    assert_eq!(stats.backoff_waits, 3);
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.current_backoff, Duration::from_secs(8));

    // The queue keeps going after dropping the exhausted task.
    let next = queue.enqueue(scene("30-35", "neutral")).await;
    assert_eq!(next, "description 5");
}

#[tokio::test(start_paused = true)]
async fn test_close_refuses_new_work_and_drains_the_rest() {
    let provider = ScriptedProvider::new(Vec::new());
    let queue = queue_with(Some(provider.clone()));

    let a = queue.enqueue(scene("20-25", "happy"));
    let b = queue.enqueue(scene("30-35", "neutral"));
    queue.close();
    assert!(queue.is_closed());

    let late = scene("40-45", "sad");
    let expected = fallback_description(&late);
    assert_eq!(queue.enqueue(late).await, expected);

    let (a, b) = tokio::join!(a, b);
    assert_eq!(a, "description 1");
    assert_eq!(b, "description 2");

    queue.join().await;
    assert_eq!(queue.stats().refused, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_analysis_is_never_sent() {
    let provider = ScriptedProvider::new(Vec::new());
    let queue = queue_with(Some(provider.clone()));

    let text = queue.enqueue(SceneDescriptor::failed("camera unplugged")).await;
    assert_eq!(text, "Scene analysis unavailable: camera unplugged");
    assert!(provider.call_offsets_ms().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recent_commentary_feeds_later_prompts() {
    let provider = ScriptedProvider::new(vec![ok("A man is typing.", 10)]);
    let queue = queue_with(Some(provider.clone()));

    queue.enqueue(scene("20-25", "happy")).await;
    queue.enqueue(scene("20-25", "happy")).await;

    let prompts = provider.prompts.lock().clone();
    assert!(!prompts[0].contains("RECENT COMMENTARY"));
    assert!(prompts[1].contains("RECENT COMMENTARY:\n- A man is typing."));
    assert_eq!(queue.history(), vec!["A man is typing.".to_string(), "description 2".to_string()]);
}
