//! Audio-completion prompts: speaker reference plus the text to speak.

use serde::Deserialize;

use crate::text::process_text;
use crate::{TtsType, VocoderError, VocoderResult};

/// Reference transcript of the built-in speaker.
pub const DEFAULT_AUDIO_TEXT: &str = "<|text_start|>the<|text_sep|>overall<|text_sep|>package<|text_sep|>from<|text_sep|>just<|text_sep|>two<|text_sep|>people<|text_sep|>is<|text_sep|>pretty<|text_sep|>remarkable<|text_sep|>sure<|text_sep|>i<|text_sep|>have<|text_sep|>some<|text_sep|>critiques<|text_sep|>about<|text_sep|>some<|text_sep|>of<|text_sep|>the<|text_sep|>gameplay<|text_sep|>aspects<|text_sep|>but<|text_sep|>its<|text_sep|>still<|text_sep|>really<|text_sep|>enjoyable<|text_sep|>and<|text_sep|>it<|text_sep|>looks<|text_sep|>lovely<|text_sep|>";

/// Audio codes of the built-in speaker for its first three words.
pub const DEFAULT_AUDIO_DATA: &str = "<|audio_start|>
the<|t_0.08|><|code_start|><|257|><|740|><|636|><|913|><|788|><|1703|><|code_end|>
overall<|t_0.36|><|code_start|><|127|><|201|><|191|><|774|><|700|><|532|><|1056|><|557|><|798|><|298|><|1741|><|747|><|1662|><|1617|><|1702|><|1527|><|368|><|1588|><|1049|><|1008|><|1625|><|747|><|1576|><|728|><|1019|><|1696|><|1765|><|code_end|>
package<|t_0.56|><|code_start|><|935|><|584|><|1319|><|627|><|1016|><|1491|><|1344|><|1117|><|1526|><|1040|><|239|><|1435|><|951|><|498|><|723|><|1180|><|535|><|789|><|1649|><|1637|><|78|><|465|><|1668|><|901|><|595|><|1675|><|117|><|1009|><|1667|><|320|><|840|><|79|><|507|><|1762|><|1508|><|1228|><|1768|><|802|><|1450|><|1457|><|232|><|639|><|code_end|>";

const CODE_START: &str = "<|code_start|>";
const CODE_END: &str = "<|code_end|>";

/// A speaker profile as exported by OuteTTS.
#[derive(Debug, Clone, Deserialize)]
pub struct Speaker {
    pub words: Vec<SpeakerWord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakerWord {
    pub word: String,
    /// Seconds.
    pub duration: f64,
    pub codes: Vec<u32>,
}

impl Speaker {
    /// Parse a speaker profile; an empty string selects the built-in one.
    pub fn from_json(json: &str) -> VocoderResult<Option<Self>> {
        if json.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(json)
            .map(Some)
            .map_err(VocoderError::Speaker)
    }

    fn audio_text(&self, tts: TtsType) -> String {
        let sep = tts.config().separator;
        let mut out = String::from("<|text_start|>");
        for w in &self.words {
            out.push_str(&w.word);
            out.push_str(sep);
        }
        out
    }

    fn audio_data(&self, tts: TtsType) -> String {
        let (code_start, code_end) = match tts {
            TtsType::OuteTtsV0_3 => ("", "<|space|>"),
            TtsType::OuteTtsV0_2 => (CODE_START, CODE_END),
        };
        let mut out = String::from("<|audio_start|>\n");
        for w in &self.words {
            out.push_str(&format!("{}<|t_{:.2}|>{code_start}", w.word, w.duration));
            for code in &w.codes {
                out.push_str(&format!("<|{code}|>"));
            }
            out.push_str(code_end);
            out.push('\n');
        }
        out
    }
}

/// Build the prompt the primary model completes with audio codes.
pub fn format_audio_prompt(speaker: Option<&Speaker>, text: &str, tts: TtsType) -> String {
    let (audio_text, audio_data) = match speaker {
        Some(s) => (s.audio_text(tts), s.audio_data(tts)),
        None => match tts {
            TtsType::OuteTtsV0_2 => (DEFAULT_AUDIO_TEXT.to_string(), DEFAULT_AUDIO_DATA.to_string()),
            TtsType::OuteTtsV0_3 => (
                DEFAULT_AUDIO_TEXT.replace("<|text_sep|>", "<|space|>"),
                DEFAULT_AUDIO_DATA
                    .replace(CODE_START, "")
                    .replace(CODE_END, "<|space|>"),
            ),
        },
    };

    format!(
        "<|im_start|>\n{audio_text}{}<|text_end|>\n{audio_data}\n",
        process_text(text, tts)
    )
}
