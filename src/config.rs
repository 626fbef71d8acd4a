use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Global settings: who the user is, which providers are active and their credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub translator: Option<TranslatorConfig>,
    #[serde(default)]
    pub speech: Option<SpeechConfig>,
    /// ISO 639-1 code of the language the voice speaks.
    #[serde(default = "default_speech_language")]
    pub speech_language: String,
    /// Where synthesized audio ends up, one file per message.
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: "Me".to_string(),
            avatar: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
        }
    }
}

/// The active translation service and its credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "api", rename_all = "snake_case")]
pub enum TranslatorConfig {
    Google { api_key: String },
    Deepl { api_key: String },
    Youdao { app_id: String, app_key: String },
    Baidu { app_id: String, app_key: String },
    /// Uses the completion endpoint with a translation prompt.
    Openai { model: String },
}

/// The active voice-synthesis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "api", rename_all = "snake_case")]
pub enum SpeechConfig {
    VitsSimpleApi {
        address: String,
        port: u16,
        #[serde(default)]
        speaker_id: u32,
    },
}

impl SpeechConfig {
    pub fn base_url(&self) -> String {
        match self {
            SpeechConfig::VitsSimpleApi { address, port, .. } => {
                let address = address.trim_end_matches('/');
                if address.starts_with("http://") || address.starts_with("https://") {
                    format!("{}:{}", address, port)
                } else {
                    format!("http://{}:{}", address, port)
                }
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user: UserConfig::default(),
            completion: CompletionConfig::default(),
            translator: None,
            speech: None,
            speech_language: default_speech_language(),
            audio_dir: default_audio_dir(),
        }
    }
}

impl AppConfig {
    /// Layers environment variables over `self`. Unset variables leave the stored
    /// value untouched.
    pub fn with_env(mut self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(name) = var("CHATBOT_USER_NAME") {
            self.user.name = name;
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            self.completion.api_key = key;
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            self.completion.base_url = url;
        }
        if let Some(lang) = var("SPEECH_LANGUAGE") {
            self.speech_language = lang;
        }
        if let Some(dir) = var("AUDIO_DIR") {
            self.audio_dir = PathBuf::from(dir);
        }

        if let Some(kind) = var("TRANSLATOR") {
            let get = |key: &str| var(key).unwrap_or_default();
            self.translator = match kind.to_lowercase().as_str() {
                "google" => Some(TranslatorConfig::Google {
                    api_key: get("GOOGLE_TRANSLATE_KEY"),
                }),
                "deepl" => Some(TranslatorConfig::Deepl {
                    api_key: get("DEEPL_API_KEY"),
                }),
                "youdao" => Some(TranslatorConfig::Youdao {
                    app_id: get("YOUDAO_APP_ID"),
                    app_key: get("YOUDAO_APP_KEY"),
                }),
                "baidu" => Some(TranslatorConfig::Baidu {
                    app_id: get("BAIDU_APP_ID"),
                    app_key: get("BAIDU_APP_KEY"),
                }),
                "openai" => Some(TranslatorConfig::Openai {
                    model: var("TRANSLATE_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".into()),
                }),
                "none" | "" => None,
                other => {
                    warn!("Unknown TRANSLATOR '{}', keeping stored setting", other);
                    self.translator.take()
                }
            };
        }

        if let Some(address) = var("VITS_ADDRESS") {
            let port = match var("VITS_PORT").map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => port,
                Some(Err(e)) => {
                    warn!("Invalid VITS_PORT ({}), using 23456", e);
                    23456
                }
                None => 23456,
            };
            let speaker_id = var("VITS_SPEAKER_ID")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            self.speech = Some(SpeechConfig::VitsSimpleApi {
                address,
                port,
                speaker_id,
            });
        }
    }
}

/// Root directory for the database and generated audio.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHATBOT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home_dir).join(".chorus")
}

fn default_speech_language() -> String {
    "ja".to_string()
}

fn default_audio_dir() -> PathBuf {
    data_dir().join("sounds")
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
