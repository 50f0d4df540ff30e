//! 辅导会话流程 - 流程层
//!
//! 核心职责：定义"一轮辅导对话"的完整处理流程
//!
//! 流程顺序：
//! 1. 取会话锁，加载题库与会话
//! 2. 题号路由（绑定 / 保持 / 找不到 / 未绑定）
//! 3. 记录用户更正，必要时针对本题重新识图
//! 4. 流式调用辅导模型，节流推送
//! 5. 写回会话

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clients::LlmBackend;
use crate::infrastructure::{Budget, SessionLocks};
use crate::models::provider::LlmProvider;
use crate::models::question::QuestionBank;
use crate::models::session::{ChatEvent, ChatMessage, ChatRequest, ChatRole, Session};
use crate::services::focus_router::{clarify_message, not_found_message};
use crate::services::relook::{apply_relook, relook_prompt, relook_reason};
use crate::services::{corrections, prompts, route_focus, FocusDecision, SessionStore, VisionService};

/// 句末标点：遇到即推送
const SENTENCE_ENDINGS: &[char] = &['。', '！', '？', '；', '.', '!', '?', ';', '\n'];

/// 心跳间隔下限（`interval_at` 不接受 0）
const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

const EXPIRED_MESSAGE: &str = "会话已过期或不存在，请重新提交批改后再提问。";

/// 辅导会话流程
///
/// - 维护会话状态机（题号绑定、更正、重新识图）
/// - 未绑定时只提示，不调用模型
/// - 同一会话的各轮对话串行执行
pub struct ChatFlow {
    llm: Arc<dyn LlmBackend>,
    vision: Arc<VisionService>,
    sessions: Arc<SessionStore>,
    locks: Arc<SessionLocks>,
    tutor_provider: LlmProvider,
    relook_timeout: Duration,
    throttle: Duration,
    heartbeat: Duration,
}

impl ChatFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        vision: Arc<VisionService>,
        sessions: Arc<SessionStore>,
        locks: Arc<SessionLocks>,
        tutor_provider: LlmProvider,
        relook_timeout: Duration,
        throttle: Duration,
        heartbeat: Duration,
    ) -> Self {
        Self {
            llm,
            vision,
            sessions,
            locks,
            tutor_provider,
            relook_timeout,
            throttle,
            heartbeat: heartbeat.max(MIN_HEARTBEAT),
        }
    }

    /// 执行一轮对话，事件写入 `events`；客户端断开（接收端关闭）时提前结束
    ///
    /// # 参数
    /// - `request`: 辅导请求
    /// - `events`: 推送通道
    pub async fn run(&self, request: ChatRequest, events: mpsc::Sender<ChatEvent>) {
        let started = Instant::now();
        let session_id = request.session_id.clone();
        let _guard = self.locks.lock(&session_id).await;

        let mut bank = match self.sessions.load_bank(&session_id).await {
            Ok(Some(bank)) => bank,
            Ok(None) => {
                warn!("⚠️ 会话 {} 没有题库（已过期或未批改）", session_id);
                emit(&events, ChatEvent::Error { message: EXPIRED_MESSAGE.to_string() }).await;
                return;
            }
            Err(e) => {
                error!("❌ 加载题库失败 ({}): {}", session_id, e);
                emit(&events, ChatEvent::Error { message: e.to_string() }).await;
                return;
            }
        };

        let mut session = match self.sessions.load_session(&session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => seed_session(&session_id, &request.history),
            Err(e) => {
                error!("❌ 加载会话失败 ({}): {}", session_id, e);
                emit(&events, ChatEvent::Error { message: e.to_string() }).await;
                return;
            }
        };
        if let Some(subject) = request.subject.filter(|s| *s != bank.subject) {
            debug!("请求学科 {} 与题库学科 {} 不一致，以题库为准", subject.name(), bank.subject.name());
        }

        // ========== 题号路由 ==========
        let numbers = bank.question_numbers();
        if let Some(stale) = session
            .focus_question_number
            .take_if(|focus| !numbers.contains(focus))
        {
            debug!("会话 {} 的焦点 {} 已不在题库中", session_id, stale);
        }

        let decision = route_focus(
            &request.question,
            &numbers,
            session.focus_question_number.as_deref(),
        );
        let focus = match decision {
            FocusDecision::Bind(number) => {
                if session.focus_question_number.as_deref() != Some(number.as_str()) {
                    info!("🎯 会话 {} 聚焦第 {} 题", session_id, number);
                }
                session.focus_question_number = Some(number.clone());
                number
            }
            FocusDecision::Keep => match session.focus_question_number.clone() {
                Some(number) => number,
                None => {
                    self.reply_without_model(&mut session, &request.question, clarify_message(&numbers), &events)
                        .await;
                    return;
                }
            },
            FocusDecision::NotFound { requested, available } => {
                info!("会话 {} 请求的第 {} 题不在题库中", session_id, requested);
                session.focus_question_number = None;
                let reply = not_found_message(&requested, &available);
                self.reply_without_model(&mut session, &request.question, reply, &events)
                    .await;
                return;
            }
            FocusDecision::Unbound => {
                session.focus_question_number = None;
                self.reply_without_model(&mut session, &request.question, clarify_message(&numbers), &events)
                    .await;
                return;
            }
        };

        // ========== 更正与重新识图 ==========
        if let Some(correction) = corrections::detect_correction(&request.question) {
            info!("📝 第 {} 题记录更正: {}", focus, correction);
            session.add_correction(&focus, correction);
        }
        self.maybe_relook(&mut bank, &mut session, &focus, &request.question, &events, started)
            .await;

        let Some(record) = bank.get(&focus).cloned() else {
            emit(&events, ChatEvent::Error { message: not_found_message(&focus, &numbers) }).await;
            return;
        };

        // ========== 流式辅导 ==========
        let mut messages = Vec::with_capacity(session.history.len() + 2);
        messages.push(ChatMessage {
            role: ChatRole::System,
            content: prompts::tutor_system_message(
                bank.subject,
                &record,
                session.corrections_for(&focus),
            ),
        });
        messages.extend(session.history.iter().cloned());
        messages.push(ChatMessage::user(request.question.clone()));

        let outcome = self.stream_reply(&messages, &focus, &events, started).await;
        session.push_message(ChatMessage::user(request.question.clone()));

        match outcome {
            StreamOutcome::Completed(reply) => {
                session.push_message(ChatMessage::assistant(reply));
                session.interaction_count += 1;
                self.save_session(&mut session).await;
                info!(
                    "✓ 会话 {} 第 {} 轮完成 (第 {} 题, {}ms)",
                    session_id,
                    session.interaction_count,
                    focus,
                    started.elapsed().as_millis()
                );
                emit(
                    &events,
                    ChatEvent::Done {
                        session_id,
                        question_number: Some(focus),
                        interaction_count: session.interaction_count,
                    },
                )
                .await;
            }
            StreamOutcome::Failed { partial, message } => {
                if !partial.is_empty() {
                    session.push_message(ChatMessage::assistant(partial));
                }
                self.save_session(&mut session).await;
                emit(&events, ChatEvent::Error { message }).await;
            }
            StreamOutcome::Disconnected => {
                info!("会话 {} 客户端已断开", session_id);
                self.save_session(&mut session).await;
            }
        }
    }

    /// 不调用模型，直接回复一条提示
    async fn reply_without_model(
        &self,
        session: &mut Session,
        question: &str,
        reply: String,
        events: &mpsc::Sender<ChatEvent>,
    ) {
        session.push_message(ChatMessage::user(question));
        session.push_message(ChatMessage::assistant(reply.clone()));
        session.interaction_count += 1;
        self.save_session(session).await;

        if emit(
            events,
            ChatEvent::Chat {
                content: reply,
                question_number: None,
            },
        )
        .await
        {
            emit(
                events,
                ChatEvent::Done {
                    session_id: session.session_id.clone(),
                    question_number: None,
                    interaction_count: session.interaction_count,
                },
            )
            .await;
        }
    }

    /// 每道题每个会话最多重新识图一次；失败不影响本轮对话
    async fn maybe_relook(
        &self,
        bank: &mut QuestionBank,
        session: &mut Session,
        focus: &str,
        question: &str,
        events: &mpsc::Sender<ChatEvent>,
        started: Instant,
    ) {
        if session.relooked.iter().any(|n| n == focus) || bank.page_images.is_empty() {
            return;
        }
        let Some(reason) = bank.get(focus).and_then(|record| relook_reason(record, question)) else {
            return;
        };
        info!("🔍 第 {} 题重新识图: {}", focus, reason.as_str());
        session.relooked.push(focus.to_string());

        let budget = Budget::start(self.relook_timeout);
        let prompt = relook_prompt(focus);
        let page_images = bank.page_images.clone();
        let result = {
            let analyze = self.vision.analyze(
                bank.vision_provider,
                &page_images,
                &prompt,
                &budget,
                self.relook_timeout,
            );
            tokio::pin!(analyze);

            let mut ticker = self.ticker();
            loop {
                tokio::select! {
                    result = &mut analyze => break result,
                    _ = ticker.tick() => {
                        emit(events, heartbeat(started)).await;
                    }
                }
            }
        };

        match result {
            Ok(output) => {
                let changed = bank
                    .get_mut(focus)
                    .is_some_and(|record| apply_relook(record, &output.text));
                if changed {
                    if let Err(e) = self.sessions.save_bank(bank).await {
                        warn!("⚠️ 重新识图结果保存失败: {}", e);
                    } else {
                        info!("✓ 第 {} 题已按重新识图结果修补", focus);
                    }
                }
            }
            Err(failure) => {
                warn!("⚠️ 第 {} 题重新识图失败: {}", focus, failure.warnings.join("; "));
            }
        }
    }

    async fn stream_reply(
        &self,
        messages: &[ChatMessage],
        focus: &str,
        events: &mpsc::Sender<ChatEvent>,
        started: Instant,
    ) -> StreamOutcome {
        let mut ticker = self.ticker();

        let open = self.llm.stream(self.tutor_provider, messages);
        tokio::pin!(open);
        let opened = loop {
            tokio::select! {
                opened = &mut open => break opened,
                _ = ticker.tick() => {
                    if !emit(events, heartbeat(started)).await {
                        return StreamOutcome::Disconnected;
                    }
                }
            }
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                error!("❌ 辅导模型调用失败 ({}): {}", self.tutor_provider, e);
                return StreamOutcome::Failed {
                    partial: String::new(),
                    message: e.to_string(),
                };
            }
        };

        let mut transcript = String::new();
        let mut last_emit = Instant::now();
        let mut pending = false;

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(delta)) => {
                        if delta.is_empty() {
                            continue;
                        }
                        transcript.push_str(&delta);
                        pending = true;
                        let sentence_done = delta.trim_end_matches(' ').ends_with(SENTENCE_ENDINGS);
                        if sentence_done || last_emit.elapsed() >= self.throttle {
                            if !emit(events, chat_event(&transcript, focus)).await {
                                return StreamOutcome::Disconnected;
                            }
                            last_emit = Instant::now();
                            pending = false;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("⚠️ 辅导流中断: {}", e);
                        if pending {
                            emit(events, chat_event(&transcript, focus)).await;
                        }
                        return StreamOutcome::Failed {
                            partial: transcript,
                            message: e.to_string(),
                        };
                    }
                    None => break,
                },
                _ = ticker.tick(), if transcript.is_empty() => {
                    if !emit(events, heartbeat(started)).await {
                        return StreamOutcome::Disconnected;
                    }
                }
                _ = events.closed() => return StreamOutcome::Disconnected,
            }
        }

        if transcript.trim().is_empty() {
            return StreamOutcome::Failed {
                partial: String::new(),
                message: "tutor model returned empty content".to_string(),
            };
        }
        if pending && !emit(events, chat_event(&transcript, focus)).await {
            return StreamOutcome::Disconnected;
        }
        StreamOutcome::Completed(transcript)
    }

    /// 首次触发在一个间隔之后
    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    }

    async fn save_session(&self, session: &mut Session) {
        if let Err(e) = self.sessions.save_session(session).await {
            error!("❌ 会话保存失败 ({}): {}", session.session_id, e);
        }
    }
}

enum StreamOutcome {
    Completed(String),
    Failed { partial: String, message: String },
    Disconnected,
}

// ========== 辅助函数 ==========

/// 服务端没有会话时，用客户端带来的历史初始化
fn seed_session(session_id: &str, history: &[ChatMessage]) -> Session {
    let mut session = Session::new(session_id);
    for message in history.iter().filter(|m| m.role != ChatRole::System) {
        session.push_message(message.clone());
    }
    session
}

fn chat_event(transcript: &str, focus: &str) -> ChatEvent {
    ChatEvent::Chat {
        content: transcript.to_string(),
        question_number: Some(focus.to_string()),
    }
}

fn heartbeat(started: Instant) -> ChatEvent {
    ChatEvent::Heartbeat {
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// 发送事件，接收端已关闭时返回 false
async fn emit(events: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> bool {
    events.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{FetchedImage, ImageFetcher, TokenStream, VisionBackend};
    use crate::error::ProviderError;
    use crate::infrastructure::{MemoryKvStore, ProviderPools};
    use crate::models::grade::ImageRef;
    use crate::models::provider::VisionProvider;
    use crate::models::question::QuestionRecord;
    use crate::models::subject::Subject;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedTutor {
        chunks: Vec<&'static str>,
        calls: AtomicUsize,
        last_messages: Mutex<Vec<ChatMessage>>,
    }

    impl ScriptedTutor {
        fn new(chunks: Vec<&'static str>) -> Self {
            Self {
                chunks,
                calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedTutor {
        async fn complete(
            &self,
            _provider: LlmProvider,
            _system_message: &str,
            _user_message: &str,
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            Err(ProviderError::Api("not used".into()))
        }

        async fn stream(
            &self,
            _provider: LlmProvider,
            messages: &[ChatMessage],
        ) -> Result<TokenStream, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = messages.to_vec();
            let chunks: Vec<Result<String, ProviderError>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    struct RelookVision(&'static str, AtomicUsize);

    #[async_trait]
    impl VisionBackend for RelookVision {
        async fn analyze(
            &self,
            _provider: VisionProvider,
            _image_urls: &[String],
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.to_string())
        }
    }

    struct NoFetch;

    #[async_trait]
    impl ImageFetcher for NoFetch {
        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, String> {
            Ok(200)
        }

        async fn download(&self, _url: &str, _timeout: Duration) -> Result<FetchedImage, String> {
            Err("offline".into())
        }
    }

    struct Harness {
        flow: ChatFlow,
        store: Arc<SessionStore>,
        tutor: Arc<ScriptedTutor>,
        vision: Arc<RelookVision>,
    }

    fn harness(chunks: Vec<&'static str>, relook_text: &'static str) -> Harness {
        harness_with_heartbeat(chunks, relook_text, Duration::from_secs(5))
    }

    fn harness_with_heartbeat(
        chunks: Vec<&'static str>,
        relook_text: &'static str,
        heartbeat: Duration,
    ) -> Harness {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(60),
        ));
        let tutor = Arc::new(ScriptedTutor::new(chunks));
        let vision = Arc::new(RelookVision(relook_text, AtomicUsize::new(0)));
        let flow = ChatFlow::new(
            tutor.clone(),
            Arc::new(VisionService::new(
                vision.clone(),
                Arc::new(NoFetch),
                None,
                ProviderPools::new(1, 1),
            )),
            store.clone(),
            Arc::new(SessionLocks::new()),
            LlmProvider::Doubao,
            Duration::from_secs(5),
            Duration::from_millis(400),
            heartbeat,
        );
        Harness {
            flow,
            store,
            tutor,
            vision,
        }
    }

    async fn seed_bank(store: &SessionStore, records: Vec<QuestionRecord>) {
        let mut bank = QuestionBank::new("s1", Subject::Math);
        bank.questions = records;
        bank.page_images = vec![ImageRef::from_url("https://img.example.com/p1.jpg")];
        store.save_bank(&mut bank).await.unwrap();
    }

    fn record(number: &str, content: &str) -> QuestionRecord {
        QuestionRecord {
            question_number: number.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    fn chat(question: &str) -> ChatRequest {
        ChatRequest {
            session_id: "s1".into(),
            question: question.into(),
            history: Vec::new(),
            subject: None,
        }
    }

    async fn run(flow: &ChatFlow, request: ChatRequest) -> Vec<ChatEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        flow.run(request, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_growing_transcript_and_saves_session() {
        let h = harness(vec!["先看", "第一步。", "再想想"], "");
        seed_bank(&h.store, vec![record("1", "计算 1+2=?"), record("28(1)①", "求阴影部分的面积，已知正方形边长为4")]).await;

        let events = run(&h.flow, chat("讲讲第28题")).await;

        let contents: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Chat { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["先看第一步。", "先看第一步。再想想"]);
        assert!(matches!(
            events.last(),
            Some(ChatEvent::Done { question_number: Some(n), interaction_count: 1, .. }) if n == "28(1)①"
        ));

        let session = h.store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(session.focus_question_number.as_deref(), Some("28(1)①"));
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[1].content, "先看第一步。再想想");

        let messages = h.tutor.last_messages.lock().unwrap().clone();
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.contains("求阴影部分的面积"));
    }

    #[tokio::test]
    async fn unknown_question_is_refused_without_model_call() {
        let h = harness(vec!["不该出现"], "");
        seed_bank(&h.store, vec![record("1", "计算 1+2=?"), record("2", "计算 2+2=?")]).await;

        let events = run(&h.flow, chat("第9题怎么做")).await;

        assert_eq!(h.tutor.calls.load(Ordering::SeqCst), 0);
        match &events[0] {
            ChatEvent::Chat { content, question_number } => {
                assert!(content.contains("没有找到第9题"));
                assert!(content.contains("1、2"));
                assert!(question_number.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
        let session = h.store.load_session("s1").await.unwrap().unwrap();
        assert!(session.focus_question_number.is_none());
    }

    #[tokio::test]
    async fn unbound_session_gets_clarifying_prompt() {
        let h = harness(vec!["不该出现"], "");
        seed_bank(&h.store, vec![record("1", "计算 1+2=?")]).await;

        let events = run(&h.flow, chat("这个怎么做")).await;

        assert_eq!(h.tutor.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(&events[0], ChatEvent::Chat { content, .. } if content.contains("想聊哪一道题")));
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn missing_bank_emits_error() {
        let h = harness(vec![], "");
        let events = run(&h.flow, chat("讲讲第1题")).await;
        assert_eq!(
            events,
            vec![ChatEvent::Error {
                message: EXPIRED_MESSAGE.to_string()
            }]
        );
    }

    #[tokio::test]
    async fn corrections_are_kept_in_context() {
        let h = harness(vec!["好的。"], "");
        seed_bank(&h.store, vec![record("3", "化简 a·b³·b，写出结果，并说明理由")]).await;

        run(&h.flow, chat("第3题不是b³，是b²")).await;

        let session = h.store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(session.corrections_for("3"), ["不是 b³，是 b²".to_string()]);
        let messages = h.tutor.last_messages.lock().unwrap().clone();
        assert!(messages[0].content.contains("不是 b³，是 b²"));
    }

    #[tokio::test]
    async fn short_diagram_stem_is_relooked_once() {
        let h = harness(
            vec!["好的。"],
            "### 第5题\n题目：如图，正方形ABCD的边长为4，E是BC的中点，求三角形ABE的面积\n",
        );
        seed_bank(&h.store, vec![record("5", "如图，求面积")]).await;

        run(&h.flow, chat("讲讲第5题")).await;
        run(&h.flow, chat("继续")).await;

        assert_eq!(h.vision.1.load(Ordering::SeqCst), 1);
        let bank = h.store.load_bank("s1").await.unwrap().unwrap();
        assert!(bank.get("5").unwrap().content.contains("边长为4"));
        let session = h.store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(session.relooked, vec!["5".to_string()]);
        assert_eq!(session.interaction_count, 2);
    }

    #[test]
    fn seed_skips_system_messages() {
        let session = seed_session(
            "s1",
            &[
                ChatMessage {
                    role: ChatRole::System,
                    content: "x".into(),
                },
                ChatMessage::user("hi"),
            ],
        );
        assert_eq!(session.history, vec![ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn zero_heartbeat_does_not_panic() {
        let h = harness_with_heartbeat(vec!["好的。"], "", Duration::ZERO);
        assert_eq!(h.flow.heartbeat, MIN_HEARTBEAT);
        let mut ticker = h.flow.ticker();
        ticker.tick().await;
    }
}
