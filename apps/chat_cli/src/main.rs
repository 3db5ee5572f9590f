use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ChatBackend, ChatClient, ClientEvent, HttpBackend, RoomHandle, SyncConfig, SyncError,
    ThreadDisplay, WsTransport,
};
use shared::domain::{Message, MessageId, MessageKind, ReactionSummary, RoomId};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_stream::{
    wrappers::{BroadcastStream, LinesStream},
    StreamExt,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{parse, Command, HELP};

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the chat server")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
    /// Room to open at start; defaults to the first room listed.
    #[arg(long)]
    room: Option<i64>,
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    safety_poll_secs: u64,
    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
    resubscribe_ms: u64,
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..=500))]
    page_size: u32,
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    unread_poll_secs: u64,
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            safety_poll_interval: Duration::from_secs(self.safety_poll_secs),
            resubscribe_delay: Duration::from_millis(self.resubscribe_ms),
            page_size: self.page_size,
            unread_poll_interval: Duration::from_secs(self.unread_poll_secs),
        }
    }
}

struct Session {
    client: Arc<ChatClient>,
    room: Option<RoomHandle>,
    open_thread: Option<MessageId>,
    printed: HashSet<MessageId>,
}

impl Session {
    fn current(&self) -> Result<RoomId> {
        self.room
            .as_ref()
            .map(RoomHandle::room_id)
            .context("join a room first with /join <room_id>")
    }

    async fn enter(&mut self, room_id: RoomId) -> Result<()> {
        let handle = match self.room.take() {
            Some(current) => self.client.switch_room(current, room_id).await?,
            None => self.client.mount_room(room_id).await?,
        };
        self.room = Some(handle);
        self.open_thread = None;
        self.printed.clear();
        println!("-- room {} --", room_id.0);
        self.print_new(room_id);
        Ok(())
    }

    fn print_new(&mut self, room_id: RoomId) {
        for message in self.client.room_messages(room_id) {
            if self.printed.insert(message.id) {
                println!("{}", format_message(&message));
            }
        }
    }

    /// Runs one command. Returns `false` when the user asked to leave.
    async fn run(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Say(text) => {
                let room_id = self.current()?;
                self.client
                    .send(room_id, &text, MessageKind::Text, None)
                    .await?;
            }
            Command::Reply { parent, text } => {
                let room_id = self.current()?;
                let reply = self
                    .client
                    .send(room_id, &text, MessageKind::Text, Some(parent))
                    .await?;
                println!("replied [{}] under [{}]", reply.id.0, parent.0);
            }
            Command::Read(message_id) => {
                let room_id = self.current()?;
                let latest = self.client.room_messages(room_id).last().map(|m| m.id);
                let Some(message_id) = message_id.or(latest) else {
                    println!("nothing to mark read");
                    return Ok(true);
                };
                self.client.mark_read(room_id, message_id).await?;
                println!("read up to [{}]", message_id.0);
            }
            Command::Thread(root_id) => {
                let display = self.client.open_thread(root_id).await?;
                if let Some(previous) = self.open_thread.replace(root_id) {
                    if previous != root_id {
                        self.client.close_thread(previous);
                    }
                }
                print_thread(&display);
            }
            Command::Expand(root_id) => {
                let expanded = self.client.toggle_thread(root_id);
                info!(root_id = root_id.0, expanded, "chat_cli: thread toggled");
                print_thread(&self.client.thread_view(root_id));
            }
            Command::Older => {
                let room_id = self.current()?;
                let added = self.client.load_older(room_id).await?;
                println!("loaded {added} older messages");
                if added > 0 {
                    self.printed.clear();
                    self.print_new(room_id);
                }
            }
            Command::Rooms => {
                for room in self.client.list_rooms().await? {
                    println!(
                        "{:>5}  {:<7}  {}  ({} members)",
                        room.room_id.0,
                        room.kind.as_str(),
                        room.name.as_deref().unwrap_or("-"),
                        room.participant_ids.len()
                    );
                }
            }
            Command::Join(room_id) => self.enter(room_id).await?,
            Command::Dm(user_id) => {
                let room = self.client.create_or_get_dm(user_id).await?;
                self.enter(room.room_id).await?;
            }
            Command::Group { name, members } => {
                let room = self.client.create_group(&name, &members).await?;
                self.enter(room.room_id).await?;
            }
            Command::React { message, emoji } => {
                let reactions = self.client.add_reaction(message, &emoji).await?;
                println!("[{}] {}", message.0, format_reactions(&reactions));
            }
            Command::Unreact { message, emoji } => {
                let reactions = self.client.remove_reaction(message, &emoji).await?;
                println!("[{}] {}", message.0, format_reactions(&reactions));
            }
            Command::Unread => {
                self.client.refresh_unread().await?;
                let mut counts = self.client.unread_counts().into_values().collect::<Vec<_>>();
                counts.sort_by_key(|c| c.channel_id);
                for count in counts {
                    println!(
                        "room {:>5}: {} unread, {} mentions",
                        count.channel_id.0, count.unread_count, count.mention_count
                    );
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn on_event(&mut self, event: ClientEvent) {
        let current = self.room.as_ref().map(RoomHandle::room_id);
        match event {
            ClientEvent::RoomUpdated { room_id } | ClientEvent::Reconciled { room_id, .. }
                if Some(room_id) == current =>
            {
                self.print_new(room_id);
            }
            ClientEvent::ThreadUpdated { root_id } if Some(root_id) == self.open_thread => {
                print_thread(&self.client.thread_view(root_id));
            }
            ClientEvent::SubscriptionChanged { room_id, state } => {
                info!(room_id = room_id.0, ?state, "chat_cli: subscription changed");
            }
            ClientEvent::FetchFailed { room_id, message } => {
                eprintln!("room {} could not refresh: {message}", room_id.0);
            }
            ClientEvent::Error(message) => warn!(%message, "chat_cli: client error"),
            _ => {}
        }
    }
}

fn format_message(message: &Message) -> String {
    let author = message
        .author_username
        .clone()
        .unwrap_or_else(|| format!("user{}", message.author_id.0));
    let mut line = format!("[{}] {author}: {}", message.id.0, message.content);
    if message.reply_count > 0 {
        line.push_str(&format!("  ({} replies)", message.reply_count));
    }
    if !message.reactions.is_empty() {
        line.push_str(&format!("  {}", format_reactions(&message.reactions)));
    }
    line
}

fn format_reactions(reactions: &[ReactionSummary]) -> String {
    reactions
        .iter()
        .map(|r| format!("{} x{}", r.emoji, r.count))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_thread(display: &ThreadDisplay) {
    println!(
        "-- thread [{}]: {} replies{} --",
        display.root_id.0,
        display.total,
        if display.hidden_count > 0 {
            format!(", {} hidden (/expand {})", display.hidden_count, display.root_id.0)
        } else {
            String::new()
        }
    );
    for entry in &display.visible {
        println!(
            "{}{}",
            "  ".repeat(entry.depth),
            format_message(&entry.message)
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let backend = Arc::new(HttpBackend::new(&args.server_url));
    let user_id = backend
        .login(&args.username)
        .await
        .map_err(SyncError::from)
        .with_context(|| format!("failed to log in at {}", args.server_url))?;
    let transport = Arc::new(WsTransport::new(backend.server_url(), user_id));
    let client = ChatClient::new(backend, transport, args.sync_config());
    client.sign_in(&args.username).await?;
    println!("signed in as {} (user_id={})", args.username, user_id.0);

    let mut session = Session {
        client: Arc::clone(&client),
        room: None,
        open_thread: None,
        printed: HashSet::new(),
    };
    let first_room = match args.room {
        Some(room_id) => Some(RoomId(room_id)),
        None => client.list_rooms().await?.first().map(|room| room.room_id),
    };
    match first_room {
        Some(room_id) => session.enter(room_id).await?,
        None => println!("no rooms yet; try /dm <user_id> or /group <name> <user_id>..."),
    }
    println!("type /help for commands");

    let mut lines = LinesStream::new(BufReader::new(stdin()).lines());
    let mut events = BroadcastStream::new(client.subscribe_events());
    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else { break };
                let line = line.context("failed to read stdin")?;
                match parse(&line) {
                    Ok(Some(command)) => match session.run(command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(error) => eprintln!("error: {error:#}"),
                    },
                    Ok(None) => {}
                    Err(usage) => eprintln!("{usage}"),
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => session.on_event(event),
                Some(Err(lagged)) => warn!(%lagged, "chat_cli: missed client events"),
                None => break,
            },
        }
    }

    drop(session);
    client.sign_out();
    Ok(())
}
