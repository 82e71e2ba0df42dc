//! Command-line TextSecure client.
//!
//! Acts as an echo service, sends one-off messages and attachments, or
//! carries on a conversation with another client.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use textsecure::{
    Client, CodeProvider, Contact, ContactProvider, Context, IncomingMessage, MessageSink,
    PasswordProvider,
};

#[derive(Parser, Debug)]
#[command(name = "textsecure", about = "TextSecure command line client")]
struct Options {
    /// Act as an echo service
    #[arg(short, long)]
    echo: bool,

    /// Contact name or phone number to send the message to
    #[arg(short, long)]
    to: Option<String>,

    /// Destination is a group
    #[arg(short, long)]
    group: bool,

    /// Create a group; the argument has the format 'name:member1:member2'
    #[arg(long)]
    newgroup: Option<String>,

    /// Leave a group named by the argument
    #[arg(long)]
    leavegroup: Option<String>,

    /// Single message to send, then exit
    #[arg(short, long)]
    message: Option<String>,

    /// File to attach
    #[arg(short, long)]
    attachment: Option<PathBuf>,

    /// Name of contact to print the identity key fingerprint of
    #[arg(short, long)]
    fingerprint: Option<String>,
}

fn read_line(prompt: &str) -> String {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return String::new();
    }
    line.trim().to_string()
}

struct Prompter;

impl CodeProvider for Prompter {
    fn verification_code(&self) -> String {
        read_line("Enter verification code> ")
    }
}

impl PasswordProvider for Prompter {
    fn storage_password(&self) -> String {
        read_line("Input storage password> ")
    }
}

struct NoContacts;

impl ContactProvider for NoContacts {
    fn local_contacts(&self) -> Vec<Contact> {
        Vec::new()
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<IncomingMessage>,
}

impl MessageSink for ChannelSink {
    fn incoming_message(&self, message: IncomingMessage) {
        let _ = self.tx.send(message);
    }

    fn delivery_receipt(&self, source: &str, timestamp: u64) {
        info!("delivery receipt from {source} for {timestamp}");
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn send(ctx: &Context, is_group: bool, to: &str, message: &str) -> anyhow::Result<()> {
    if is_group {
        ctx.send_group_message(to, message).await?;
    } else {
        ctx.send_message(to, message).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let options = Options::parse();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client {
        root_dir: PathBuf::from("."),
        code_provider: Arc::new(Prompter),
        password_provider: Some(Arc::new(Prompter)),
        contact_provider: Some(Arc::new(NoContacts)),
        message_sink: Arc::new(ChannelSink { tx }),
    };

    let ctx = Arc::new(textsecure::setup(client).await.context("setup failed")?);

    if let Some(id) = &options.fingerprint {
        println!("Fingerprint for {id}: {}", ctx.identity_fingerprint(id).await?);
        return Ok(());
    }

    if let Some(arg) = &options.newgroup {
        let mut parts = arg.split(':');
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .context("--newgroup needs the format name:member1:member2")?;
        let members: Vec<String> = parts.map(str::to_string).collect();
        ctx.new_group(name, &members).await?;
        println!("Created group {name}");
        return Ok(());
    }

    if let Some(name) = &options.leavegroup {
        ctx.leave_group(name).await?;
        println!("Left group {name}");
        return Ok(());
    }

    if let Some(to) = &options.to {
        if let Some(path) = &options.attachment {
            let data = std::fs::read(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let body = options.message.as_deref().unwrap_or("");
            ctx.send_attachment(to, body, content_type_for(path), &data)
                .await?;
            return Ok(());
        }
        if let Some(message) = &options.message {
            send(&ctx, options.group, to, message).await?;
            return Ok(());
        }

        // Conversation mode: read lines from the console and send them.
        let conversation_ctx = ctx.clone();
        let peer = to.clone();
        let is_group = options.group;
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        if let Err(e) = send(&conversation_ctx, is_group, &peer, line.trim()).await
                        {
                            error!("send failed: {e}");
                        }
                    }
                    Ok(Some(_)) => {}
                    _ => break,
                }
            }
        });
    }

    // Deliver incoming messages: echo them back or print them.
    let echo = options.echo;
    let printer_ctx = ctx.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if echo {
                let (is_group, to) = match &msg.group {
                    Some(group) => (true, group.clone()),
                    None => (false, msg.source.clone()),
                };
                if !msg.message.is_empty() {
                    if let Err(e) = send(&printer_ctx, is_group, &to, &msg.message).await {
                        error!("echo failed: {e}");
                    }
                }
                continue;
            }
            let from = match &msg.group {
                Some(group) => format!("{}[{}]", msg.source, group),
                None => msg.source.clone(),
            };
            if !msg.message.is_empty() {
                println!("{from} : {}", msg.message);
            }
            for attachment in &msg.attachments {
                println!("{from} sent attachment {} ({})", attachment.id, attachment.content_type);
            }
        }
    });

    ctx.listen().await?;
    Ok(())
}
