use assess::{ChatMessage, ChatModel, InvocationError, ProcessingStatus, RawResponse, Verdict, NO_EVIDENCE_NOTE};
use async_trait::async_trait;
use evidence::{Control, DisabledOcr, ExtractionError, OcrEngine, OcrOutput};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toe::{AppConfig, CANCELLED_ERROR, build_orchestrator};

const SUFFICIENT: &str = r#"{"summary": "Payment approval signed by the CFO (approval.pdf)",
  "verdict": "sufficient", "gaps": [], "reasoning": "The sampled payment carries a dated CFO signature."}"#;

/// Replies per control id, read from the prompt; unscripted calls get `SUFFICIENT`.
#[derive(Default)]
struct FakeModel {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, InvocationError>>>>,
    fallback: Option<Result<String, InvocationError>>,
    delays: HashMap<String, Duration>,
    seen: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl FakeModel {
    fn script(self, control_id: &str, replies: Vec<Result<&str, InvocationError>>) -> Self {
        self.scripts.lock().unwrap().insert(
            control_id.to_string(),
            replies.into_iter().map(|r| r.map(str::to_string)).collect(),
        );
        self
    }

    fn calls_for(&self, control_id: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|(id, _)| id == control_id).count()
    }

    fn requests(&self) -> HashMap<String, Vec<ChatMessage>> {
        self.seen.lock().unwrap().iter().cloned().collect()
    }
}

fn control_id_in(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .flat_map(|m| m.content.lines())
        .find_map(|line| line.strip_prefix("CONTROL ID: "))
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl ChatModel for FakeModel {
    fn name(&self) -> &str {
        "fake-auditor"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<RawResponse, InvocationError> {
        let control_id = control_id_in(messages);
        self.seen.lock().unwrap().push((control_id.clone(), messages.to_vec()));

        if let Some(delay) = self.delays.get(&control_id) {
            tokio::time::sleep(*delay).await;
        }

        let scripted = self.scripts.lock().unwrap().get_mut(&control_id).and_then(|q| q.pop_front());
        let reply = scripted
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Ok(SUFFICIENT.to_string()));
        reply.map(|content| RawResponse {
            content,
            prompt_tokens: Some(1000),
            completion_tokens: Some(100),
            attempts: 1,
        })
    }
}

/// Image OCR fails a fixed number of times before recognising text.
struct FlakyOcr {
    failures_left: AtomicUsize,
    image_calls: AtomicUsize,
}

impl FlakyOcr {
    fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(times),
            image_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl OcrEngine for FlakyOcr {
    async fn recognize_image(&self, _image: &[u8]) -> Result<OcrOutput, ExtractionError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ExtractionError::Ocr("tesseract crashed".to_string()));
        }
        Ok(OcrOutput {
            text: "User access review completed 2024-03-31, approved by IT Manager".to_string(),
            confidence: 0.91,
        })
    }

    async fn recognize_pdf(&self, _pdf: &[u8], _max_pages: usize) -> Result<Vec<OcrOutput>, ExtractionError> {
        Ok(vec![OcrOutput {
            text: "Payment approved and signed by CFO".to_string(),
            confidence: 0.95,
        }])
    }
}

fn rate_limited() -> Result<&'static str, InvocationError> {
    Err(InvocationError::RateLimited {
        retry_after: None,
        message: "Rate limit reached for requests".to_string(),
    })
}

fn config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.evidence_root = root.to_path_buf();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.concurrency.max_concurrent_controls = 3;
    config
}

fn control(id: &str) -> Control {
    Control::new(
        format!("R-{}", id),
        "Financial misstatement",
        id,
        format!("Control {} operates as designed", id),
    )
}

fn write(root: &Path, relative: &str, bytes: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn text_pdf(text: &str) -> Vec<u8> {
    use lopdf::dictionary;
    use lopdf::{Document, Object, Stream};

    let mut doc = Document::with_version("1.4");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let content = format!("BT /F1 12 Tf 100 700 Td ({text}) Tj ET");
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => content_id,
        "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
    });
    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
    });
    if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(page_id) {
        dict.set("Parent", pages_id);
    }
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

#[tokio::test]
async fn approvals_missing_folder_and_flaky_services() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "C001/approval.pdf", &text_pdf("Payment approved and signed by CFO"));
    write(dir.path(), "C003/review_screenshot.png", b"not really a png");

    let model = Arc::new(FakeModel::default().script(
        "C003",
        vec![rate_limited(), rate_limited(), rate_limited(), Ok(SUFFICIENT)],
    ));
    let ocr = FlakyOcr::failing(2);
    let orchestrator = build_orchestrator(&config(dir.path()), model.clone(), ocr.clone());

    let run = orchestrator
        .run(vec![control("C001"), control("C002"), control("C003")], CancellationToken::new())
        .await;

    let ids: Vec<_> = run.results.iter().map(|r| r.control.control_id.as_str()).collect();
    assert_eq!(ids, vec!["C001", "C002", "C003"]);

    let c001 = &run.results[0];
    assert_eq!(c001.status, ProcessingStatus::Success);
    assert_eq!(c001.verdict, Verdict::Sufficient);
    assert!(c001.gaps.is_empty());
    assert_eq!(c001.evidence.ok, 1);
    assert_eq!(c001.model_calls, 1);

    let c002 = &run.results[1];
    assert_eq!(c002.verdict, Verdict::Insufficient);
    assert!(c002.notes.contains(&NO_EVIDENCE_NOTE.to_string()));
    assert_eq!(c002.model_calls, 0);
    assert_eq!(model.calls_for("C002"), 0);

    let c003 = &run.results[2];
    assert_eq!(c003.status, ProcessingStatus::Success);
    assert_eq!(c003.verdict, Verdict::Sufficient);
    assert_eq!(c003.evidence.ok, 1);
    assert_eq!(c003.evidence.failed, 0);
    assert_eq!(c003.model_calls, 4);
    assert_eq!(ocr.image_calls.load(Ordering::SeqCst), 3);

    assert_eq!(run.usage.retries, 3);
    assert_eq!(run.usage.rate_limited, 3);
    assert_eq!(run.usage.calls, 5);
    assert_eq!(run.usage.successful_calls, 2);
    assert_eq!(run.counts.success, 3);
    assert_eq!(run.counts.no_evidence, 1);
    assert!(!run.cancelled);
}

#[tokio::test]
async fn input_order_survives_uneven_latency() {
    let dir = tempfile::tempdir().unwrap();
    let ids: Vec<String> = (1..=12).map(|i| format!("C{:03}", i)).collect();

    let mut model = FakeModel::default();
    for (i, id) in ids.iter().enumerate() {
        write(dir.path(), &format!("{}/log.txt", id), format!("Review log for {}", id).as_bytes());
        // Later controls finish first.
        model.delays.insert(id.clone(), Duration::from_millis(((12 - i) * 7 % 40) as u64));
    }

    let mut config = config(dir.path());
    config.concurrency.max_concurrent_controls = 4;
    let run = build_orchestrator(&config, Arc::new(model), Arc::new(DisabledOcr))
        .run(ids.iter().map(|id| control(id)).collect(), CancellationToken::new())
        .await;

    let got: Vec<_> = run.results.iter().map(|r| r.control.control_id.clone()).collect();
    assert_eq!(got, ids);
    assert!(run.results.iter().all(|r| r.status == ProcessingStatus::Success));
}

#[tokio::test]
async fn identical_inputs_produce_identical_requests() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "C001/approval.txt", b"Approved by CFO on 2024-01-15");
    write(dir.path(), "C001/sub/tickets.csv", b"id,status\n1,closed\n2,closed\n");
    write(dir.path(), "C002/notes.md", b"# Access review\nAll leavers removed within 24h");

    let mut requests = Vec::new();
    for _ in 0..2 {
        let model = Arc::new(FakeModel::default());
        build_orchestrator(&config(dir.path()), model.clone(), Arc::new(DisabledOcr))
            .run(vec![control("C001"), control("C002")], CancellationToken::new())
            .await;
        requests.push(model.requests());
    }

    assert_eq!(requests[0].len(), 2);
    assert_eq!(requests[0], requests[1]);
}

#[tokio::test]
async fn unreadable_files_are_counted_and_named() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "C010/approval.txt", b"Change ticket CHG-1042 approved by CAB");
    write(dir.path(), "C010/broken.pdf", b"%PDF-1.4 truncated");
    write(dir.path(), "C010/archive.bin", b"\x00\x01\x02\x03");
    write(dir.path(), "C010/.DS_Store", b"ignored");

    let model = Arc::new(FakeModel::default());
    let run = build_orchestrator(&config(dir.path()), model.clone(), Arc::new(DisabledOcr))
        .run(vec![control("C010")], CancellationToken::new())
        .await;

    let result = &run.results[0];
    assert_eq!(result.evidence.ok, 1);
    assert_eq!(result.evidence.failed, 2);
    assert!(result.notes.iter().any(|n| n.starts_with("unreadable: broken.pdf")));
    assert!(result.notes.iter().any(|n| n.starts_with("unreadable: archive.bin")));

    let prompt = &model.requests()["C010"][1].content;
    assert!(prompt.contains("=== UNREADABLE EVIDENCE ==="));
    assert!(!prompt.contains("DS_Store"));
}

#[tokio::test]
async fn malformed_replies_are_never_sufficient() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "C020/evidence.txt", b"Reconciliation signed off");

    let model = Arc::new(FakeModel {
        fallback: Some(Ok("CONCLUSION: SUFFICIENT. The evidence looks fine.".to_string())),
        ..FakeModel::default()
    });
    let run = build_orchestrator(&config(dir.path()), model.clone(), Arc::new(DisabledOcr))
        .run(vec![control("C020")], CancellationToken::new())
        .await;

    let result = &run.results[0];
    assert_eq!(result.status, ProcessingStatus::Partial);
    assert_eq!(result.verdict, Verdict::Indeterminate);
    assert!(result.error.as_deref().unwrap().starts_with("parse failure"));
    assert_eq!(model.calls_for("C020"), 2);
    assert_eq!(run.counts.partial, 1);
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_control() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "C030/evidence.txt", b"Backup restore test passed");
    write(dir.path(), "C031/evidence.txt", b"Firewall rules reviewed");

    let model = Arc::new(FakeModel::default().script(
        "C030",
        (0..5)
            .map(|_| {
                Err(InvocationError::Server {
                    status: 503,
                    message: "overloaded".to_string(),
                })
            })
            .collect(),
    ));
    let run = build_orchestrator(&config(dir.path()), model.clone(), Arc::new(DisabledOcr))
        .run(vec![control("C030"), control("C031")], CancellationToken::new())
        .await;

    let failed = &run.results[0];
    assert_eq!(failed.status, ProcessingStatus::Failed);
    assert_eq!(failed.verdict, Verdict::Indeterminate);
    assert!(failed.error.as_deref().unwrap().contains("gave up after 5 attempts"));
    assert_eq!(failed.model_calls, 5);

    assert_eq!(run.results[1].status, ProcessingStatus::Success);
    assert_eq!(run.usage.retries, 4);
    assert_eq!(run.counts.failed, 1);
}

#[tokio::test]
async fn batch_timeout_stops_new_controls() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = FakeModel::default();
    for id in ["C040", "C041", "C042"] {
        write(dir.path(), &format!("{}/evidence.txt", id), b"Quarterly review minutes");
        model.delays.insert(id.to_string(), Duration::from_millis(300));
    }
    let model = Arc::new(model);

    let mut config = config(dir.path());
    config.concurrency.max_concurrent_controls = 1;
    let run = build_orchestrator(&config, model.clone(), Arc::new(DisabledOcr))
        .with_batch_timeout(Some(Duration::from_millis(50)))
        .run(vec![control("C040"), control("C041"), control("C042")], CancellationToken::new())
        .await;

    assert!(run.cancelled);
    assert_eq!(run.results.len(), 3);
    assert_eq!(run.results[0].status, ProcessingStatus::Success);
    for result in &run.results[1..] {
        assert_eq!(result.status, ProcessingStatus::Failed);
        assert_eq!(result.error.as_deref(), Some(CANCELLED_ERROR));
    }
    assert_eq!(model.calls_for("C041"), 0);
}
