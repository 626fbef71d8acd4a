use super::LanguageDetector;

/// Guesses the language from the Unicode scripts in the text.
///
/// Kana wins over Han, since Japanese mixes both; Han alone reads as Chinese.
/// Good enough to decide whether a reply needs translating before it is voiced.
pub struct ScriptDetector;

#[derive(Default)]
struct Counts {
    kana: usize,
    han: usize,
    hangul: usize,
    cyrillic: usize,
    latin: usize,
}

impl LanguageDetector for ScriptDetector {
    fn detect(&self, text: &str) -> Option<String> {
        let mut counts = Counts::default();
        for c in text.chars() {
            match c as u32 {
                0x3040..=0x30FF | 0x31F0..=0x31FF | 0xFF66..=0xFF9D => counts.kana += 1,
                0x4E00..=0x9FFF | 0x3400..=0x4DBF => counts.han += 1,
                0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F => counts.hangul += 1,
                0x0400..=0x04FF => counts.cyrillic += 1,
                _ if c.is_ascii_alphabetic() => counts.latin += 1,
                _ => {}
            }
        }

        let lang = if counts.kana > 0 {
            "ja"
        } else if counts.hangul > 0 {
            "ko"
        } else if counts.han > 0 {
            "zh"
        } else if counts.cyrillic > counts.latin {
            "ru"
        } else if counts.latin > 0 {
            "en"
        } else {
            return None;
        };
        Some(lang.to_string())
    }
}
