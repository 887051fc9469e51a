#![forbid(unsafe_code)]

use tokio::io::{AsyncBufReadExt, BufReader};
use vigor_client_core::{ClientConfig, ClientSession};
use vigor_domain::{ClientTag, UserId};
use vigor_protocol::ServerFrame;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: vigor_client --user <id> [--server tcp://host:port]\n\
\n\
Options:\n\
\t--user     User identity to enter the channel as (required)\n\
\t--server   Server endpoint (default: tcp://127.0.0.1:9400)\n\
\t--help     Show this help\n\
\n\
Commands once connected:\n\
\t/msg <user> <text>    Send a message\n\
\t/read <user>          Mark messages from <user> as read\n\
\t/quit                 Exit\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> (String, UserId) {
	let mut server = "tcp://127.0.0.1:9400".to_string();
	let mut user: Option<UserId> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--server" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				server = v;
			}
			"--user" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				match UserId::new(v) {
					Ok(id) => user = Some(id),
					Err(e) => {
						eprintln!("invalid --user: {e}");
						usage_and_exit();
					}
				}
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(user) = user else {
		eprintln!("--user is required");
		usage_and_exit();
	};

	(server, user)
}

fn print_frame(frame: &ServerFrame) {
	match frame {
		ServerFrame::ChannelEntered { user, unread_total } => {
			println!("* channel entered as {user} ({unread_total} unread)");
		}
		ServerFrame::NewMessage { message } => match message.body.text() {
			Some(text) => println!("[{}] {}", message.sender, text),
			None => {
				let att = message.body.attachment().expect("non-text body is an attachment");
				println!("[{}] ({}: {})", message.sender, att.kind, att.url);
			}
		},
		ServerFrame::NewNotification { notification } => {
			println!("! {} — {}", notification.title, notification.body);
		}
		ServerFrame::Error { code, message } => {
			eprintln!("server error {code}: {message}");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
		.with_target(false)
		.init();

	let (server, user) = parse_args();

	let cfg = ClientConfig::from_tcp_endpoint(&server, user.clone())?;
	let (session, unread_total) = ClientSession::connect(cfg).await?;
	println!("* connected to {server} as {user} ({unread_total} unread)");

	let (mut reader, mut writer) = session.split();
	let mut lines = BufReader::new(tokio::io::stdin()).lines();

	loop {
		tokio::select! {
			frame = reader.next_frame() => {
				match frame? {
					Some(frame) => print_frame(&frame),
					None => {
						println!("* server closed the connection");
						break;
					}
				}
			}
			line = lines.next_line() => {
				let Some(line) = line? else {
					break;
				};
				let line = line.trim();
				if line.is_empty() {
					continue;
				}

				if line == "/quit" {
					break;
				} else if let Some(rest) = line.strip_prefix("/msg ") {
					let Some((peer, text)) = rest.split_once(' ') else {
						eprintln!("usage: /msg <user> <text>");
						continue;
					};
					match UserId::new(peer) {
						Ok(peer) => {
							writer.send_text(&user, &peer, text, Some(ClientTag::new_v4())).await?;
						}
						Err(e) => eprintln!("invalid user: {e}"),
					}
				} else if let Some(peer) = line.strip_prefix("/read ") {
					match UserId::new(peer.trim()) {
						Ok(peer) => writer.mark_read(&user, &peer).await?,
						Err(e) => eprintln!("invalid user: {e}"),
					}
				} else {
					eprintln!("unknown command (try /msg, /read, /quit)");
				}
			}
		}
	}

	Ok(())
}
