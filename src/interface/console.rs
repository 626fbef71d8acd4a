use crate::{
    bus::{Event, EventBus, NotificationLevel},
    chat::Message,
    entity::{ChatbotData, ChatbotProfile, GenerationParams},
    manager::OrchestratorRegistry,
    store::Store,
};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

const HELP: &str = "\
Commands:
  /list                     list chatbots
  /new <name> [prompt...]   create a chatbot
  /use <n|id>               talk to a chatbot
  /history                  start a new conversation
  /speak on|off             voice replies
  /say                      voice the last reply again
  /resend                   drop the last reply and ask again
  /undo                     delete the last message
  /prompt <text>            replace the system prompt
  /stop                     stop generating
  /delete <n|id>            delete a chatbot
  /save                     save everything
  /reload                   re-read settings (stored, then environment)
  /help                     display this text
  /quit                     exit
Anything else is sent to the current chatbot.";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    List,
    New { name: String, prompt: String },
    Use(String),
    History,
    Speak(bool),
    Replay,
    Resend,
    Undo,
    Prompt(String),
    Stop,
    Delete(String),
    Save,
    Reload,
    Help,
    Quit,
    Chat(String),
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Chat(line.to_string()));
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (rest, ""),
    };
    let command = match cmd.to_lowercase().as_str() {
        "list" | "ls" => Command::List,
        "new" if !arg.is_empty() => {
            let (name, prompt) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
            Command::New {
                name: name.to_string(),
                prompt: prompt.trim().to_string(),
            }
        }
        "use" if !arg.is_empty() => Command::Use(arg.to_string()),
        "history" => Command::History,
        "speak" => match arg {
            "on" => Command::Speak(true),
            "off" => Command::Speak(false),
            _ => Command::Unknown(line.to_string()),
        },
        "say" => Command::Replay,
        "resend" => Command::Resend,
        "undo" => Command::Undo,
        "prompt" if !arg.is_empty() => Command::Prompt(arg.to_string()),
        "stop" => Command::Stop,
        "delete" if !arg.is_empty() => Command::Delete(arg.to_string()),
        "save" => Command::Save,
        "reload" => Command::Reload,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

#[derive(Debug, Clone, Default)]
struct Session {
    chatbot_id: Option<String>,
    history_id: Option<String>,
    speak: bool,
}

/// Line-oriented front-end on stdin/stdout.
#[derive(Clone)]
pub struct ConsoleInterface {
    bus: Arc<EventBus>,
    registry: Arc<OrchestratorRegistry>,
    store: Arc<Store>,
    user_name: String,
    session: Arc<Mutex<Session>>,
}

impl ConsoleInterface {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<OrchestratorRegistry>,
        store: Arc<Store>,
        user_name: String,
    ) -> Self {
        Self {
            bus,
            registry,
            store,
            user_name,
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    fn session(&self) -> Session {
        self.session.lock().unwrap().clone()
    }

    /// Returns when the user quits or stdin closes.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut bus_rx = self.bus.subscribe();
        let interface = self.clone();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(event) => interface.print_event(event),
                    Err(RecvError::Lagged(n)) => warn!("Console missed {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(first) = self.registry.snapshot().await.iter().next() {
            self.select(first);
        }
        println!("{}", HELP);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(command) = parse_command(&line) else {
                continue;
            };
            if command == Command::Quit {
                break;
            }
            if let Err(e) = self.answer_command(command).await {
                error!("Command failed: {}", e);
                println!("! {}", e);
            }
        }

        info!("Console closed");
        Ok(())
    }

    fn print_event(&self, event: Event) {
        let session = self.session();
        match event {
            Event::MessageProduced { history_id, message } => {
                if session.history_id.as_deref() == Some(history_id.as_str()) {
                    println!("{}: {}", message.sender, message.text);
                }
            }
            Event::SpeechProduced { audio_path, message, .. } => {
                println!("  [{} voiced: {}]", message.sender, audio_path.display());
            }
            Event::BusyStateChanged { chatbot_id, busy } => {
                if session.chatbot_id.as_deref() == Some(chatbot_id.as_str()) && busy {
                    println!("  ...");
                }
            }
            Event::Notification { level, message, .. } => match level {
                NotificationLevel::Error => println!("! {}", message),
                NotificationLevel::Warning => println!("? {}", message),
                NotificationLevel::Info => println!("  {}", message),
            },
        }
    }

    fn select(&self, data: &ChatbotData) {
        let history_id = data
            .histories
            .latest()
            .or_else(|| data.histories.iter().next())
            .map(|h| h.id.clone());
        let mut session = self.session.lock().unwrap();
        session.chatbot_id = Some(data.id.clone());
        session.history_id = history_id;
        println!("Talking to {} ({})", data.profile.name, data.id);
    }

    /// Accepts a 1-based position from `/list` or a chatbot id.
    async fn resolve(&self, key: &str) -> Option<ChatbotData> {
        let list = self.registry.snapshot().await;
        if let Ok(n) = key.parse::<usize>() {
            return n.checked_sub(1).and_then(|i| list.iter().nth(i)).cloned();
        }
        list.get(key).cloned()
    }

    fn current(&self) -> anyhow::Result<(String, String)> {
        let session = self.session();
        match (session.chatbot_id, session.history_id) {
            (Some(chatbot_id), Some(history_id)) => Ok((chatbot_id, history_id)),
            _ => anyhow::bail!("no chatbot selected, try /list and /use"),
        }
    }

    async fn answer_command(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::List => {
                let current = self.session().chatbot_id;
                for (i, data) in self.registry.snapshot().await.iter().enumerate() {
                    let marker = if current.as_deref() == Some(data.id.as_str()) { "*" } else { " " };
                    println!("{}{}. {}", marker, i + 1, data);
                }
            }
            Command::New { name, prompt } => {
                let data = ChatbotData::new(ChatbotProfile::new(name, prompt), GenerationParams::default());
                self.store.save_chatbot(&data).await?;
                self.registry.create(data.clone()).await;
                self.select(&data);
            }
            Command::Use(key) => match self.resolve(&key).await {
                Some(data) => self.select(&data),
                None => println!("! no chatbot {}", key),
            },
            Command::History => {
                let (chatbot_id, _) = self.current()?;
                let history_id = self.registry.get(&chatbot_id)?.create_history().await;
                self.session.lock().unwrap().history_id = Some(history_id);
                println!("New conversation");
            }
            Command::Speak(on) => {
                self.session.lock().unwrap().speak = on;
                println!("Voice {}", if on { "on" } else { "off" });
            }
            Command::Replay => {
                let (chatbot_id, history_id) = self.current()?;
                let data = self.registry.get(&chatbot_id)?.snapshot().await;
                let last = data
                    .histories
                    .get(&history_id)
                    .and_then(|h| h.messages().iter().rev().find(|m| !m.is_user).cloned());
                match last {
                    Some(message) => self.registry.speak(&history_id, message).await?,
                    None => println!("! nothing to say yet"),
                }
            }
            Command::Resend => {
                let (chatbot_id, history_id) = self.current()?;
                let data = self.registry.get(&chatbot_id)?.snapshot().await;
                let last_user = data
                    .histories
                    .get(&history_id)
                    .and_then(|h| h.messages().iter().rev().find(|m| m.is_user).cloned());
                match last_user {
                    Some(message) => {
                        let speak = self.session().speak;
                        self.registry
                            .resend(&chatbot_id, &history_id, &message.id, speak)
                            .await?
                    }
                    None => println!("! nothing to resend"),
                }
            }
            Command::Undo => {
                let (chatbot_id, history_id) = self.current()?;
                let orchestrator = self.registry.get(&chatbot_id)?;
                let last = orchestrator
                    .snapshot()
                    .await
                    .histories
                    .get(&history_id)
                    .and_then(|h| h.latest().cloned());
                match last {
                    Some(message) => {
                        orchestrator.delete_message(&history_id, &message.id).await?;
                        println!("Deleted \"{}\"", message.text);
                    }
                    None => println!("! nothing to delete"),
                }
            }
            Command::Prompt(prompt) => {
                let (chatbot_id, _) = self.current()?;
                let orchestrator = self.registry.get(&chatbot_id)?;
                let mut data = orchestrator.snapshot().await;
                data.profile.system_prompt = prompt;
                orchestrator.update_data(&data).await;
                self.store.save_chatbot(&orchestrator.snapshot().await).await?;
                println!("Prompt updated");
            }
            Command::Stop => {
                let (chatbot_id, _) = self.current()?;
                self.registry.stop(&chatbot_id).await?;
            }
            Command::Delete(key) => match self.resolve(&key).await {
                Some(data) => {
                    self.registry.delete(&data.id).await?;
                    self.store.delete_chatbot(&data.id).await?;
                    let mut session = self.session.lock().unwrap();
                    if session.chatbot_id.as_deref() == Some(data.id.as_str()) {
                        *session = Session {
                            speak: session.speak,
                            ..Session::default()
                        };
                    }
                    println!("Deleted {}", data.profile.name);
                }
                None => println!("! no chatbot {}", key),
            },
            Command::Save => {
                self.store.save_chatbots(&self.registry.snapshot().await).await?;
                println!("Saved");
            }
            Command::Reload => {
                let config = self.store.load_config().await?.unwrap_or_default().with_env();
                self.registry.reconfigure(&config)?;
                self.store.save_config(&config).await?;
                info!("Settings reloaded");
            }
            Command::Help => println!("{}", HELP),
            Command::Chat(text) => {
                let (chatbot_id, history_id) = self.current()?;
                let speak = self.session().speak;
                let message = Message::user(chatbot_id, text, self.user_name.clone());
                self.registry.receive_message(&history_id, message, speak).await?;
            }
            Command::Unknown(line) => println!("? unknown command {}, try /help", line),
            Command::Quit => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn parses_commands_and_plain_text() {
        assert_eq!(parse_command("   "), None);
        assert_eq!(parse_command("hello there"), Some(Command::Chat("hello there".into())));
        assert_eq!(parse_command("/list"), Some(Command::List));
        assert_eq!(
            parse_command("/new Nene You are Nene, a cheerful girl."),
            Some(Command::New {
                name: "Nene".into(),
                prompt: "You are Nene, a cheerful girl.".into(),
            })
        );
        assert_eq!(parse_command("/use 2"), Some(Command::Use("2".into())));
        assert_eq!(parse_command("/speak on"), Some(Command::Speak(true)));
        assert_eq!(parse_command("/SPEAK off"), Some(Command::Speak(false)));
        assert_eq!(parse_command("/prompt Be brief."), Some(Command::Prompt("Be brief.".into())));
        assert_eq!(parse_command("/reload"), Some(Command::Reload));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
    }

    #[test]
    fn incomplete_commands_are_unknown() {
        assert!(matches!(parse_command("/use"), Some(Command::Unknown(_))));
        assert!(matches!(parse_command("/new"), Some(Command::Unknown(_))));
        assert!(matches!(parse_command("/speak loud"), Some(Command::Unknown(_))));
        assert!(matches!(parse_command("/frobnicate"), Some(Command::Unknown(_))));
    }

    #[tokio::test]
    async fn reload_applies_stored_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("chorus.db")).await.unwrap();
        store.init().await.unwrap();
        store.save_config(&AppConfig::default()).await.unwrap();

        let bus = Arc::new(EventBus::new());
        let mut events = bus.subscribe();
        let registry = Arc::new(OrchestratorRegistry::new(&AppConfig::default(), bus.clone()).unwrap());
        let console = ConsoleInterface::new(bus, registry, Arc::new(store.clone()), "Me".into());

        console.answer_command(Command::Reload).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::Notification { level: NotificationLevel::Info, .. }
        ));
        assert!(store.load_config().await.unwrap().is_some());
    }
}
