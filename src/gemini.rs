//! Gemini Live API wire types
//!
//! Serde models for the messages exchanged over the BidiGenerateContent
//! websocket, and the mapping from server content to [`TransportEvent`]s.

use crate::events::TransportEvent;
use crate::transport::LiveConfig;
use serde::{Deserialize, Serialize};

pub const LIVE_API_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Mime type of outbound microphone audio.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResponseModality;

    fn live_config() -> LiveConfig {
        LiveConfig {
            model: "models/gemini-2.0-flash-live-001".to_string(),
            response_modality: ResponseModality::Audio,
            voice: "Puck".to_string(),
            system_instruction: "You are a quiz host.".to_string(),
            output_transcription: true,
            input_transcription: false,
        }
    }

    #[test]
    fn test_setup_serialization() {
        let msg = ClientMessage::Setup(BidiGenerateContentSetup::from_config(&live_config()));
        let json = serde_json::to_value(&msg).unwrap();

        let setup = &json["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "You are a quiz host.");
        assert!(setup["outputAudioTranscription"].is_object());
        assert!(setup.get("inputAudioTranscription").is_none());
        assert!(setup["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn test_realtime_input_serialization() {
        let msg = ClientMessage::audio("AAAA".to_string());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["realtimeInput"]["audio"]["data"], "AAAA");
        assert_eq!(json["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert!(json["realtimeInput"].get("audioStreamEnd").is_none());

        let end = serde_json::to_value(ClientMessage::audio_stream_end()).unwrap();
        assert_eq!(end, serde_json::json!({"realtimeInput": {"audioStreamEnd": true}}));
    }

    #[test]
    fn test_server_message_parsing() {
        let setup: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(matches!(setup, ServerMessage::SetupComplete { .. }));

        let go_away: ServerMessage =
            serde_json::from_str(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert!(matches!(go_away, ServerMessage::GoAway { .. }));

        let content: ServerMessage = serde_json::from_str(
            r#"{"serverContent": {"modelTurn": {"parts": [{"text": "Hello!"}]}}, "usageMetadata": {}}"#,
        )
        .unwrap();
        match content {
            ServerMessage::ServerContent { server_content } => {
                assert_eq!(
                    server_content.into_events(),
                    vec![TransportEvent::Text("Hello!".to_string())]
                );
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        assert!(serde_json::from_str::<ServerMessage>(r#"{"usageMetadata": {}}"#).is_err());
    }

    #[test]
    fn test_server_content_event_order() {
        let content: ServerContent = serde_json::from_str(
            r#"{
                "interrupted": true,
                "inputTranscription": {"text": "paris"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "Correct"}
                ]},
                "outputTranscription": {"text": "Correct!"},
                "turnComplete": true
            }"#,
        )
        .unwrap();

        assert_eq!(
            content.into_events(),
            vec![
                TransportEvent::Interrupted,
                TransportEvent::InputTranscript("paris".to_string()),
                TransportEvent::Audio("AAA=".to_string()),
                TransportEvent::Text("Correct".to_string()),
                TransportEvent::OutputTranscript("Correct!".to_string()),
                TransportEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_empty_fragments_are_skipped() {
        let content: ServerContent = serde_json::from_str(
            r#"{"modelTurn": {"parts": [{"text": ""}, {}]}, "outputTranscription": {}}"#,
        )
        .unwrap();
        assert!(content.into_events().is_empty());
    }
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Empty marker object enabling a transcription stream.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: String,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl BidiGenerateContentSetup {
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![config.response_modality.as_str().to_string()],
                temperature: None,
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                }),
            }),
            system_instruction: Some(Content {
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                    inline_data: None,
                }],
                role: None,
            }),
            output_audio_transcription: config
                .output_transcription
                .then(AudioTranscriptionConfig::default),
            input_audio_transcription: config
                .input_transcription
                .then(AudioTranscriptionConfig::default),
        }
    }
}

/// A chunk of realtime input.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Microphone audio, already in base64 text form.
    pub fn audio(data: String) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: Some(INPUT_AUDIO_MIME.to_string()),
                data,
            }),
            audio_stream_end: None,
        })
    }

    pub fn audio_stream_end() -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        })
    }
}

/// Server -> client messages
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: ServerContent,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<Content>,
    pub interrupted: bool,
    pub turn_complete: bool,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Transcription {
    pub text: String,
}

impl ServerContent {
    /// Flatten into events.
    ///
    /// An interruption comes first so that audio in the same message lands
    /// on a cleared timeline; turn completion comes last.
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if self.interrupted {
            events.push(TransportEvent::Interrupted);
        }

        if let Some(t) = self.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(TransportEvent::InputTranscript(t.text));
        }

        for part in self.model_turn.map(|c| c.parts).unwrap_or_default() {
            if let Some(blob) = part.inline_data {
                events.push(TransportEvent::Audio(blob.data));
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(TransportEvent::Text(text));
            }
        }

        if let Some(t) = self.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(TransportEvent::OutputTranscript(t.text));
        }

        if self.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }

        events
    }
}
