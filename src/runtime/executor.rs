//! Session runtime executor

use super::error::SessionError;
use super::selection::Selection;
use super::traits::{ChatApi, StreamTransport};

use crate::api::{
    ApiError, KbCatalog, KbId, ModelId, ModelInfo, PersistedMessage, SessionId, StartChatRequest,
};
use crate::state_machine::{
    transition, Conversation, Effect, Event, MessageRef, SessionUpdate, TransitionError,
};
use crate::stream::{interpret, parse_title, DEFAULT_TITLE};
use crate::transport::{
    StreamHandle, StreamId, StreamRequest, TransportEvent, TransportMessage, TransportSink,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

const UPDATE_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 32;

/// Requests accepted by a running session
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load(SessionId),
    LoadCatalog,
    /// Close the open session; the next `Send` starts a new one
    NewChat,
    StartChat(String),
    /// Sent to the open session, or starts a new one when none is open
    Send(String),
    Edit {
        target: MessageRef,
        content: String,
    },
    EditLatest(String),
    Retry(MessageRef),
    RetryLatest,
    SelectModel(ModelId),
    SelectKb(Option<KbId>),
    ToggleTool(String),
    ToggleThinking,
    WatchTitle,
    Shutdown,
}

/// Where a load gets its session from
enum LoadSource {
    Existing(SessionId),
    /// Create the session from its first question, then open it
    New(StartChatRequest),
}

struct Fetched {
    session_id: SessionId,
    models: Vec<ModelInfo>,
    kbs: KbCatalog,
    history: Vec<PersistedMessage>,
}

/// Outcome of a background load, tagged with the load that produced it
struct LoadCompletion {
    seq: u64,
    watch_title: bool,
    result: Result<Fetched, ApiError>,
}

async fn fetch_session<A: ChatApi>(api: Arc<A>, source: LoadSource) -> Result<Fetched, ApiError> {
    let session_id = match source {
        LoadSource::Existing(session_id) => session_id,
        LoadSource::New(request) => {
            let session_id = api.start_session(&request).await?;
            tracing::info!(session_id = %session_id, "Session started");
            session_id
        }
    };
    let (models, kbs, history) = futures::try_join!(
        api.available_models(),
        api.knowledge_bases(),
        api.session_messages(&session_id),
    )?;
    Ok(Fetched {
        session_id,
        models,
        kbs,
        history,
    })
}

/// Generic session runtime that can work with any REST and transport
/// implementation
pub struct SessionRuntime<A, T>
where
    A: ChatApi + 'static,
    T: StreamTransport + 'static,
{
    api: Arc<A>,
    transport: Arc<T>,
    conversation: Conversation,
    selection: Selection,
    session_id: Option<SessionId>,
    title: Option<String>,
    /// Chat connections by id; removed on their terminal event
    streams: HashMap<StreamId, StreamHandle>,
    title_stream: Option<StreamHandle>,
    sink: TransportSink,
    transport_rx: mpsc::UnboundedReceiver<TransportMessage>,
    /// Bumped whenever a load starts or is abandoned
    load_seq: u64,
    load_task: Option<JoinHandle<()>>,
    load_tx: mpsc::UnboundedSender<LoadCompletion>,
    load_rx: mpsc::UnboundedReceiver<LoadCompletion>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl<A, T> SessionRuntime<A, T>
where
    A: ChatApi + 'static,
    T: StreamTransport + 'static,
{
    pub fn new(api: A, transport: T, selection: Selection) -> Self {
        let (sink, transport_rx) = mpsc::unbounded_channel();
        let (load_tx, load_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            api: Arc::new(api),
            transport: Arc::new(transport),
            conversation: Conversation::new(),
            selection,
            session_id: None,
            title: None,
            streams: HashMap::new(),
            title_stream: None,
            sink,
            transport_rx,
            load_seq: 0,
            load_task: None,
            load_tx,
            load_rx,
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    // ========================================================================
    // Effects
    // ========================================================================

    fn apply(&mut self, event: Event) -> Result<(), TransitionError> {
        let result = transition(&mut self.conversation, event)?;
        for effect in result.effects {
            self.execute_effect(effect);
        }
        Ok(())
    }

    fn execute_effect(&mut self, effect: Effect) {
        match effect {
            Effect::OpenStream { stream, request } => {
                tracing::info!(
                    stream_id = %stream,
                    kind = ?request.kind,
                    path = %request.path,
                    "Opening stream"
                );
                let handle = self.transport.open(stream, request, self.sink.clone());
                self.streams.insert(stream, handle);
            }
            Effect::CancelStream { stream } => self.release_stream(stream),
            Effect::NotifyClient(update) => self.notify(update),
        }
    }

    fn notify(&self, update: SessionUpdate) {
        // no subscribers is fine
        let _ = self.updates.send(update);
    }

    fn notify_selection(&self) {
        self.notify(SessionUpdate::SelectionChanged {
            model_id: self.selection.model_id().cloned(),
            kb_id: self.selection.kb_id().cloned(),
            tools: self.selection.tools().to_vec(),
            thinking: self.selection.thinking_enabled(),
        });
    }

    fn release_stream(&mut self, stream: StreamId) {
        if let Some(handle) = self.streams.remove(&stream) {
            handle.cancel();
        }
    }

    fn release_title_stream(&mut self) {
        if let Some(handle) = self.title_stream.take() {
            handle.cancel();
        }
    }

    fn current_session(&self) -> Result<SessionId, SessionError> {
        self.session_id.clone().ok_or(SessionError::NoSession)
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Drop any load in flight. A result it already queued is ignored.
    fn abort_load(&mut self) {
        self.load_seq += 1;
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
    }

    /// Clear the transcript and enter the loading state. Returns the
    /// sequence number the load's result must carry.
    fn begin_load(&mut self) -> Result<u64, SessionError> {
        self.abort_load();
        self.release_title_stream();
        self.apply(Event::LoadStarted)?;
        self.session_id = None;
        self.title = None;
        Ok(self.load_seq)
    }

    fn finish_load(
        &mut self,
        result: Result<Fetched, ApiError>,
    ) -> Result<SessionId, SessionError> {
        let Fetched {
            session_id,
            models,
            kbs,
            history,
        } = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                self.apply(Event::LoadFailed {
                    message: e.to_string(),
                })?;
                return Err(e.into());
            }
        };

        self.selection.set_catalog(models, kbs);
        self.selection.restore(&history);
        let resume = history
            .last()
            .filter(|m| m.is_pending_user())
            .map(|m| {
                self.selection
                    .resume_params(session_id.clone(), m.parsed_options())
            });
        let resumed = resume.is_some();

        self.session_id = Some(session_id.clone());
        self.notify(SessionUpdate::SessionOpened {
            session_id: session_id.clone(),
        });
        self.apply(Event::Restored { history, resume })?;
        self.notify_selection();

        tracing::info!(
            session_id = %session_id,
            messages = self.conversation.messages().len(),
            resumed,
            "Session loaded"
        );
        Ok(session_id)
    }

    /// Fetch in the background; the result comes back through the command
    /// loop, which keeps refusing generation requests until then
    fn spawn_load(&mut self, source: LoadSource, watch_title: bool) -> Result<(), SessionError> {
        let seq = self.begin_load()?;
        let api = Arc::clone(&self.api);
        let done = self.load_tx.clone();
        self.load_task = Some(tokio::spawn(async move {
            let result = fetch_session(api, source).await;
            // the runtime may have stopped meanwhile
            let _ = done.send(LoadCompletion {
                seq,
                watch_title,
                result,
            });
        }));
        Ok(())
    }

    fn handle_loaded(&mut self, loaded: LoadCompletion) {
        if loaded.seq != self.load_seq {
            tracing::debug!(seq = loaded.seq, "Dropping superseded load");
            return;
        }
        self.load_task = None;

        let outcome = self.finish_load(loaded.result).and_then(|_| {
            if loaded.watch_title {
                self.watch_title()
            } else {
                Ok(())
            }
        });
        if let Err(e) = outcome {
            self.report(&e);
        }
    }

    /// Open `session_id`, replacing whatever was open. A pending last user
    /// message is resumed with the options it was first sent with.
    pub async fn load(&mut self, session_id: SessionId) -> Result<(), SessionError> {
        self.begin_load()?;
        let result = fetch_session(Arc::clone(&self.api), LoadSource::Existing(session_id)).await;
        self.finish_load(result).map(drop)
    }

    /// Fetch the model and knowledge base catalog without opening a session
    pub async fn load_catalog(&mut self) -> Result<(), SessionError> {
        let api = Arc::clone(&self.api);
        let (models, kbs) = futures::try_join!(api.available_models(), api.knowledge_bases())?;
        self.selection.set_catalog(models, kbs);

        let model = self
            .selection
            .current_model()
            .or_else(|| self.selection.models().first())
            .map(|m| m.model_id.clone());
        if let Some(model_id) = model {
            self.selection.select_model(model_id, false)?;
        }
        if let Some(kb_id) = self.selection.kb_id().cloned() {
            if let Err(e) = self.selection.select_kb(Some(kb_id)) {
                tracing::warn!(error = %e, "Dropping preferred knowledge base");
                self.selection.select_kb(None)?;
            }
        }

        tracing::info!(models = self.selection.models().len(), "Catalog loaded");
        self.notify_selection();
        Ok(())
    }

    async fn start_request(&mut self, question: &str) -> Result<StartChatRequest, SessionError> {
        if question.trim().is_empty() {
            return Err(TransitionError::EmptyContent.into());
        }
        if self.conversation.is_loading() {
            return Err(TransitionError::LoadInProgress.into());
        }
        if self.conversation.is_generating() {
            return Err(TransitionError::GenerationInProgress.into());
        }
        if self.selection.models().is_empty() {
            self.load_catalog().await?;
        }

        Ok(StartChatRequest {
            model_id: self.selection.model_id().cloned(),
            question: question.to_string(),
            kb_id: self
                .selection
                .kb_id()
                .filter(|_| self.selection.supports_kb())
                .cloned(),
            options: self.selection.options(),
        })
    }

    /// Create a session from its first question, open it and wait for its
    /// title. The server stores the question as a pending message which
    /// the load then resumes.
    pub async fn start_chat(&mut self, question: &str) -> Result<SessionId, SessionError> {
        let request = self.start_request(question).await?;
        self.begin_load()?;
        let result = fetch_session(Arc::clone(&self.api), LoadSource::New(request)).await;
        let session_id = self.finish_load(result)?;
        self.watch_title()?;
        Ok(session_id)
    }

    async fn spawn_start(&mut self, question: &str) -> Result<(), SessionError> {
        let request = self.start_request(question).await?;
        self.spawn_load(LoadSource::New(request), true)
    }

    /// Release every connection and forget the session
    pub fn teardown(&mut self) {
        self.abort_load();
        self.release_title_stream();
        if let Err(e) = self.apply(Event::Teardown) {
            tracing::warn!(error = %e, "Teardown refused");
        }
        for (_, handle) in self.streams.drain() {
            handle.cancel();
        }
        if let Some(session_id) = self.session_id.take() {
            tracing::info!(session_id = %session_id, "Session closed");
        }
    }

    // ========================================================================
    // Generation
    // ========================================================================

    pub fn send(&mut self, text: &str) -> Result<(), SessionError> {
        let params = self.selection.params(self.current_session()?);
        self.apply(Event::Send {
            text: text.to_string(),
            params,
        })?;
        Ok(())
    }

    pub fn edit(&mut self, target: MessageRef, content: &str) -> Result<(), SessionError> {
        let params = self.selection.params(self.current_session()?);
        self.apply(Event::Edit {
            target,
            content: content.to_string(),
            params,
        })?;
        Ok(())
    }

    pub fn edit_latest(&mut self, content: &str) -> Result<(), SessionError> {
        let target = self
            .conversation
            .last_user_message()
            .map(MessageRef::of)
            .ok_or(TransitionError::TargetNotFound)?;
        self.edit(target, content)
    }

    pub fn retry(&mut self, target: MessageRef) -> Result<(), SessionError> {
        let params = self.selection.params(self.current_session()?);
        self.apply(Event::Retry { target, params })?;
        Ok(())
    }

    pub fn retry_latest(&mut self) -> Result<(), SessionError> {
        let params = self.selection.params(self.current_session()?);
        self.apply(Event::RetryLatest { params })?;
        Ok(())
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn select_model(&mut self, model_id: ModelId) -> Result<(), SessionError> {
        self.selection.select_model(model_id, false)?;
        self.notify_selection();
        Ok(())
    }

    pub fn select_kb(&mut self, kb_id: Option<KbId>) -> Result<(), SessionError> {
        self.selection.select_kb(kb_id)?;
        self.notify_selection();
        Ok(())
    }

    /// Returns false when the current model does not offer `tool`
    pub fn toggle_tool(&mut self, tool: &str) -> bool {
        let changed = self.selection.toggle_tool(tool);
        if changed {
            self.notify_selection();
        }
        changed
    }

    /// Returns false when the model pins thinking to its default
    pub fn toggle_thinking(&mut self) -> bool {
        let changed = self.selection.toggle_thinking();
        if changed {
            self.notify_selection();
        }
        changed
    }

    // ========================================================================
    // Title
    // ========================================================================

    /// Wait for the server-generated title of the open session
    pub fn watch_title(&mut self) -> Result<(), SessionError> {
        let session_id = self.current_session()?;
        self.release_title_stream();

        let stream = self.conversation.allocate_stream_id();
        tracing::debug!(session_id = %session_id, stream_id = %stream, "Awaiting title");
        let handle = self
            .transport
            .open(stream, StreamRequest::title(&session_id), self.sink.clone());
        self.title_stream = Some(handle);
        Ok(())
    }

    fn handle_title(&mut self, event: TransportEvent) {
        let title = match event {
            TransportEvent::Open(_) => return,
            TransportEvent::Message(frame) => parse_title(&frame).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Unreadable title event");
                DEFAULT_TITLE.to_string()
            }),
            TransportEvent::Error(e) => {
                tracing::warn!(error = %e, "Title stream failed");
                DEFAULT_TITLE.to_string()
            }
            TransportEvent::Close => DEFAULT_TITLE.to_string(),
        };
        self.release_title_stream();
        self.title = Some(title.clone());
        self.notify(SessionUpdate::Title { title });
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Route one transport event. Events from released connections are
    /// dropped.
    pub fn handle_transport(&mut self, message: TransportMessage) {
        let TransportMessage { stream, event } = message;

        if self
            .title_stream
            .as_ref()
            .is_some_and(|h| h.stream_id() == stream)
        {
            self.handle_title(event);
            return;
        }
        if !self.streams.contains_key(&stream) {
            tracing::debug!(stream_id = %stream, "Dropping event from released stream");
            return;
        }

        let outcome = match event {
            TransportEvent::Open(meta) => {
                tracing::info!(stream_id = %stream, status = meta.status, "Stream opened");
                self.apply(Event::StreamOpened { stream })
            }
            TransportEvent::Message(frame) => match interpret(&frame) {
                Ok(Some(event)) => self.apply(Event::Stream { stream, event }),
                Ok(None) => Ok(()),
                Err(e) => {
                    tracing::error!(stream_id = %stream, error = %e, "Malformed stream event");
                    self.release_stream(stream);
                    let message = e.to_string();
                    let outcome = self.apply(Event::StreamFailed {
                        stream,
                        message: message.clone(),
                    });
                    self.notify(SessionUpdate::Failure { message });
                    outcome
                }
            },
            TransportEvent::Error(e) => {
                self.streams.remove(&stream);
                let outcome = self.apply(Event::StreamFailed {
                    stream,
                    message: e.to_string(),
                });
                if !e.is_recoverable() {
                    tracing::error!(
                        stream_id = %stream,
                        kind = ?e.kind,
                        error = %e,
                        "Stream rejected"
                    );
                    self.notify(SessionUpdate::Failure {
                        message: e.to_string(),
                    });
                }
                outcome
            }
            TransportEvent::Close => {
                self.streams.remove(&stream);
                tracing::info!(stream_id = %stream, "Stream closed");
                self.apply(Event::StreamClosed { stream })
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(stream_id = %stream, error = %e, "Transport event refused");
        }
    }

    /// Handle every transport event already queued. Returns how many were
    /// handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.transport_rx.try_recv() {
            self.handle_transport(message);
            handled += 1;
        }
        handled
    }

    // ========================================================================
    // Command loop
    // ========================================================================

    fn report(&self, error: &SessionError) {
        let message = error.to_string();
        if error.is_refusal() {
            tracing::warn!(error = %error, "Request refused");
            self.notify(SessionUpdate::Warning { message });
        } else {
            tracing::error!(error = %error, "Request failed");
            self.notify(SessionUpdate::Failure { message });
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Load(session_id) => {
                self.spawn_load(LoadSource::Existing(session_id), false)
            }
            Command::LoadCatalog => self.load_catalog().await,
            Command::NewChat => {
                self.teardown();
                self.title = None;
                Ok(())
            }
            Command::StartChat(question) => self.spawn_start(&question).await,
            Command::Send(text) => {
                if self.session_id.is_some() {
                    self.send(&text)
                } else {
                    self.spawn_start(&text).await
                }
            }
            Command::Edit { target, content } => self.edit(target, &content),
            Command::EditLatest(content) => self.edit_latest(&content),
            Command::Retry(target) => self.retry(target),
            Command::RetryLatest => self.retry_latest(),
            Command::SelectModel(model_id) => self.select_model(model_id),
            Command::SelectKb(kb_id) => self.select_kb(kb_id),
            Command::ToggleTool(tool) => {
                if !self.toggle_tool(&tool) {
                    self.notify(SessionUpdate::Warning {
                        message: format!("Tool not available for this model: {tool}"),
                    });
                }
                Ok(())
            }
            Command::ToggleThinking => {
                if !self.toggle_thinking() {
                    self.notify(SessionUpdate::Warning {
                        message: "Thinking is fixed for this model".to_string(),
                    });
                }
                Ok(())
            }
            Command::WatchTitle => self.watch_title(),
            Command::Shutdown => Ok(()),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::info!("Starting session runtime");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            self.report(&e);
                        }
                    }
                },
                Some(message) = self.transport_rx.recv() => {
                    self.handle_transport(message);
                }
                Some(loaded) = self.load_rx.recv() => {
                    self.handle_loaded(loaded);
                }
            }
        }

        self.teardown();
        tracing::info!("Session runtime stopped");
    }

    /// Run on a background task
    pub fn spawn(self) -> SessionHandle {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let updates = self.updates.clone();
        let task = tokio::spawn(self.run(rx));
        SessionHandle {
            commands,
            updates,
            task,
        }
    }
}

/// Client side of a spawned [`SessionRuntime`]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<SessionUpdate>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    pub fn subscribe(&self) -> BroadcastStream<SessionUpdate> {
        BroadcastStream::new(self.updates.subscribe())
    }

    /// Stop the runtime and wait for it to release its connections
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Session runtime task failed");
        }
    }
}
