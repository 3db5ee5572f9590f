use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use shared::domain::{MessageId, MessageKind, RoomId, RoomKind, UserId};
use storage::{NewMessage, Storage};

/// Seeds the chat store directly. Rows written here skip the send pipeline, so
/// connected clients only see them after their next reconciliation.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
    },
    CreateGroup {
        name: String,
        /// Usernames to add; unknown ones are created.
        #[arg(required = true)]
        members: Vec<String>,
    },
    CreateChannel {
        name: String,
    },
    CreateDm {
        first: String,
        second: String,
    },
    Post {
        room_id: i64,
        author: String,
        content: String,
        #[arg(long)]
        parent: Option<i64>,
    },
    /// Three users, a group with a threaded conversation and one DM.
    Demo,
}

async fn user(storage: &Storage, username: &str) -> Result<UserId> {
    let username = username.trim();
    if username.is_empty() {
        bail!("username must not be empty");
    }
    storage
        .create_user(username)
        .await
        .with_context(|| format!("failed to create user {username}"))
}

async fn post(
    storage: &Storage,
    room_id: RoomId,
    author_id: UserId,
    content: &str,
    parent: Option<MessageId>,
    created_at: chrono::DateTime<Utc>,
) -> Result<MessageId> {
    let message = storage
        .insert_message(NewMessage {
            room_id,
            author_id,
            parent_message_id: parent,
            content: content.to_string(),
            kind: MessageKind::Text,
            created_at,
        })
        .await?;
    Ok(message.id)
}

async fn demo(storage: &Storage) -> Result<()> {
    let alice = user(storage, "alice").await?;
    let bob = user(storage, "bob").await?;
    let carol = user(storage, "carol").await?;

    let desk = storage
        .create_room(RoomKind::Group, Some("desk"), None)
        .await?;
    for member in [alice, bob, carol] {
        storage.add_participant(desk, member).await?;
    }

    let start = Utc::now() - Duration::minutes(10);
    let at = |minutes: i64| start + Duration::minutes(minutes);
    let root = post(storage, desk, alice, "watching the open, anyone long $SPY?", None, at(0)).await?;
    let reply = post(storage, desk, bob, "small size, stop under VWAP", Some(root), at(1)).await?;
    post(storage, desk, carol, "@bob where's your target?", Some(reply), at(2)).await?;
    post(storage, desk, bob, "prior day high", Some(reply), at(3)).await?;
    post(storage, desk, carol, "journaled my entry, review after close", None, at(4)).await?;

    let (dm, _) = storage.get_or_create_dm(alice, bob).await?;
    post(storage, dm, bob, "nice call this morning", None, at(5)).await?;

    println!(
        "seeded users alice={} bob={} carol={}, group room_id={}, dm room_id={}",
        alice.0, bob.0, carol.0, desk.0, dm.0
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username } => {
            let user_id = user(&storage, &username).await?;
            println!("user {username} has user_id={}", user_id.0);
        }
        Command::CreateGroup { name, members } => {
            let room_id = storage
                .create_room(RoomKind::Group, Some(&name), None)
                .await?;
            for member in &members {
                let user_id = user(&storage, member).await?;
                storage.add_participant(room_id, user_id).await?;
            }
            println!("created group room_id={} with {} members", room_id.0, members.len());
        }
        Command::CreateChannel { name } => {
            let room_id = storage
                .create_room(RoomKind::Channel, Some(&name), None)
                .await?;
            println!("created channel room_id={}", room_id.0);
        }
        Command::CreateDm { first, second } => {
            let a = user(&storage, &first).await?;
            let b = user(&storage, &second).await?;
            if a == b {
                bail!("a direct message needs two different users");
            }
            let (room_id, created) = storage.get_or_create_dm(a, b).await?;
            let verb = if created { "created" } else { "found existing" };
            println!("{verb} dm room_id={}", room_id.0);
        }
        Command::Post {
            room_id,
            author,
            content,
            parent,
        } => {
            let room_id = RoomId(room_id);
            if storage.room_kind(room_id).await?.is_none() {
                bail!("room {} does not exist", room_id.0);
            }
            let author_id = user(&storage, &author).await?;
            storage.add_participant(room_id, author_id).await?;
            let message_id = post(
                &storage,
                room_id,
                author_id,
                &content,
                parent.map(MessageId),
                Utc::now(),
            )
            .await?;
            println!("posted message_id={}", message_id.0);
        }
        Command::Demo => demo(&storage).await?,
    }

    Ok(())
}
