//! rag-chat - terminal client for a RAG chat backend
//!
//! Plain lines are sent as questions; lines starting with `/` are
//! commands. Answers are printed as they stream in.

use rag_chat::api::{
    ApiError, HttpChatApi, RemoteId, SessionId, SessionListQuery, SessionSearchQuery,
};
use rag_chat::config::ClientConfig;
use rag_chat::runtime::{Command, ProductionRuntime, Selection};
use rag_chat::state_machine::{Role, SessionUpdate};
use rag_chat::transport::HttpTransport;
use std::convert::Infallible;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HELP: &str = "\
commands:
  /new                 start a new conversation with the next question
  /load <id>           open a session
  /sessions            list recent sessions
  /search <keyword>    search sessions
  /delete <id>         delete a session
  /models              list models
  /model <id>          select a model
  /kb <id|none>        select a knowledge base
  /tool <name>         toggle a tool
  /think               toggle thinking
  /edit <text>         rewrite the latest question
  /retry               regenerate the latest answer
  /title               wait for the session title
  /quit                exit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ClientConfig::from_env();
    tracing::info!(api_base = %config.api_base, "Starting rag-chat");

    let api = HttpChatApi::new(&config)?;
    let transport = HttpTransport::new(&config);
    let selection = Selection::with_preferences(config.model_id.clone(), config.kb_id.clone());
    let runtime = ProductionRuntime::new(api.clone(), transport, selection);
    let handle = runtime.spawn();
    let printer = tokio::spawn(print_updates(handle.subscribe()));

    match config.session_id.clone() {
        Some(session_id) => handle.send(Command::Load(session_id)).await?,
        None => handle.send(Command::LoadCatalog).await?,
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => println!("{HELP}"),
            Input::Invalid(message) => eprintln!("{message}"),
            Input::Session(command) => handle.send(command).await?,
            Input::Query(query) => {
                if let Err(e) = run_query(&api, query).await {
                    eprintln!("error: {e}");
                    if e.is_unauthorized() {
                        eprintln!("check the token in RAG_TOKEN");
                    }
                }
            }
        }
    }

    handle.shutdown().await;
    printer.abort();
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "rag_chat=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("RAG_LOG_FORMAT").is_ok_and(|v| v == "pretty") {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

// ============================================================================
// Input
// ============================================================================

/// Backend lookups answered directly rather than through the session
#[derive(Debug, PartialEq)]
enum Query {
    Sessions,
    Search(String),
    Delete(SessionId),
    Models,
}

#[derive(Debug, PartialEq)]
enum Input {
    Empty,
    Quit,
    Help,
    Invalid(String),
    Session(Command),
    Query(Query),
}

fn remote_id(raw: &str) -> RemoteId {
    raw.parse().unwrap_or_else(|never: Infallible| match never {})
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Session(Command::Send(line.to_string()));
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    let needs_arg = |usage: &str, make: &dyn Fn(&str) -> Input| {
        if arg.is_empty() {
            Input::Invalid(format!("usage: {usage}"))
        } else {
            make(arg)
        }
    };

    match name {
        "quit" | "exit" => Input::Quit,
        "help" => Input::Help,
        "new" => Input::Session(Command::NewChat),
        "load" => needs_arg("/load <id>", &|a| Input::Session(Command::Load(remote_id(a)))),
        "sessions" => Input::Query(Query::Sessions),
        "search" => needs_arg("/search <keyword>", &|a| {
            Input::Query(Query::Search(a.to_string()))
        }),
        "delete" => needs_arg("/delete <id>", &|a| Input::Query(Query::Delete(remote_id(a)))),
        "models" => Input::Query(Query::Models),
        "model" => needs_arg("/model <id>", &|a| {
            Input::Session(Command::SelectModel(remote_id(a)))
        }),
        "kb" => needs_arg("/kb <id|none>", &|a| {
            let kb = (a != "none").then(|| remote_id(a));
            Input::Session(Command::SelectKb(kb))
        }),
        "tool" => needs_arg("/tool <name>", &|a| {
            Input::Session(Command::ToggleTool(a.to_string()))
        }),
        "think" => Input::Session(Command::ToggleThinking),
        "edit" => needs_arg("/edit <text>", &|a| {
            Input::Session(Command::EditLatest(a.to_string()))
        }),
        "retry" => Input::Session(Command::RetryLatest),
        "title" => Input::Session(Command::WatchTitle),
        other => Input::Invalid(format!("unknown command /{other}, try /help")),
    }
}

// ============================================================================
// Output
// ============================================================================

async fn run_query(api: &HttpChatApi, query: Query) -> Result<(), ApiError> {
    match query {
        Query::Sessions => {
            let list = api.list_sessions(&SessionListQuery::default()).await?;
            for group in &list.groups {
                println!("{:?}", group.group);
                for item in &group.items {
                    println!("  {:>8}  {}", item.id, item.title.as_deref().unwrap_or("-"));
                }
            }
            if list.has_more {
                println!("  ...");
            }
        }
        Query::Search(keyword) => {
            let hits = api.search_sessions(&SessionSearchQuery::new(keyword)).await?;
            if hits.is_empty() {
                println!("no matches");
            }
            for hit in hits {
                println!(
                    "{:>8}  {}",
                    hit.session_id,
                    hit.session_title.as_deref().unwrap_or("-")
                );
                for snippet in &hit.content_list {
                    println!("          {}", snippet.content);
                }
            }
        }
        Query::Delete(session_id) => {
            api.delete_session(&session_id).await?;
            println!("deleted {session_id}");
        }
        Query::Models => {
            for model in api.available_models().await? {
                println!(
                    "{:>8}  {} ({})  tools: [{}]",
                    model.model_id,
                    model.display_name(),
                    model.provider,
                    model.tools().join(", ")
                );
            }
        }
    }
    Ok(())
}

async fn print_updates(mut updates: BroadcastStream<SessionUpdate>) {
    while let Some(update) = updates.next().await {
        match update {
            Ok(update) => render(&update),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Display fell behind, updates dropped");
            }
        }
    }
}

fn render(update: &SessionUpdate) {
    let mut out = std::io::stdout().lock();
    // stdout going away is not worth crashing for
    let _ = match update {
        SessionUpdate::SessionOpened { session_id } => writeln!(out, "== session {session_id} =="),
        SessionUpdate::Restored { messages } => messages.iter().try_for_each(|m| {
            let who = match m.role {
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            writeln!(out, "{who}> {}", m.content)
        }),
        SessionUpdate::MessageAppended { message } if message.role == Role::Assistant => {
            write!(out, "assistant> ")
        }
        SessionUpdate::ContentDelta { text, .. } => write!(out, "{text}"),
        SessionUpdate::ThinkingDelta { text, .. } => {
            eprint!("{text}");
            Ok(())
        }
        SessionUpdate::GenerationChanged { generating: false } => writeln!(out),
        SessionUpdate::SelectionChanged {
            model_id,
            kb_id,
            tools,
            thinking,
        } => writeln!(
            out,
            "-- model {} | kb {} | tools [{}] | thinking {}",
            model_id.as_ref().map_or_else(|| "-".to_string(), ToString::to_string),
            kb_id.as_ref().map_or_else(|| "-".to_string(), ToString::to_string),
            tools.join(", "),
            if *thinking { "on" } else { "off" },
        ),
        SessionUpdate::Title { title } => writeln!(out, "-- title: {title}"),
        SessionUpdate::Warning { message } => writeln!(out, "warning: {message}"),
        SessionUpdate::Failure { message } => writeln!(out, "error: {message}"),
        SessionUpdate::MessageAppended { .. }
        | SessionUpdate::MessageRemoved { .. }
        | SessionUpdate::MessageUpdated { .. }
        | SessionUpdate::GenerationChanged { .. } => Ok(()),
    }
    .and_then(|()| out.flush());
}
