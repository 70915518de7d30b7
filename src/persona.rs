//! # Subjects and Tutor Personas
//!
//! Each subject has a tutor with a fixed voice and a persona instruction that
//! is sent to the service when the session is set up.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SessionConfig;
use crate::live::SessionSetup;

/// Subject the student wants to be tutored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subject {
    /// Environmental Impact Assessment (licensing, CONAMA resolutions, state agencies)
    EnvironmentalImpact,
    /// Bioethics and the legislation governing the biology profession
    Bioethics,
}

impl std::str::FromStr for Subject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aia" | "eia" | "environmental-impact" | "environmental_impact" | "environment" => {
                Ok(Subject::EnvironmentalImpact)
            }
            "bioethics" | "bioetica" | "bioética" | "ethics" | "legislation" => {
                Ok(Subject::Bioethics)
            }
            _ => Err(format!("Unknown subject: {}", s)),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl Subject {
    pub fn title(&self) -> &'static str {
        match self {
            Subject::EnvironmentalImpact => "Environmental Impact Assessment",
            Subject::Bioethics => "Bioethics and Legislation",
        }
    }

    pub fn persona(&self) -> Persona {
        match self {
            Subject::EnvironmentalImpact => Persona {
                tutor_name: "Dra. Gaia",
                role: "Doctor in Environmental Management",
                voice_id: "Kore",
                instruction: "You are Dra. Gaia, a senior mentor in environmental impact \
                    assessment. Answer in Brazilian Portuguese, technically, briefly and \
                    directly. Talk about environmental licensing, CONAMA resolutions and the \
                    state environmental agency. This is a real-time voice conversation, so \
                    sound natural.",
            },
            Subject::Bioethics => Persona {
                tutor_name: "Dra. Sofia",
                role: "Consultant in Legislation and Bioethics",
                voice_id: "Puck",
                instruction: "You are Dra. Sofia, a mentor in bioethics and legislation. \
                    Answer in Brazilian Portuguese, ethically and with legal precision. Talk \
                    about the Federal Council of Biology and the law governing the biology \
                    profession. This is a real-time voice conversation, so sound natural.",
            },
        }
    }
}

/// Tutor presented to the student for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persona {
    pub tutor_name: &'static str,
    pub role: &'static str,
    pub voice_id: &'static str,
    pub instruction: &'static str,
}

impl Persona {
    /// Transport setup for a session with this tutor.
    pub fn session_setup(&self, config: &SessionConfig) -> SessionSetup {
        SessionSetup {
            system_instruction: self.instruction.to_string(),
            voice_id: self.voice_id.to_string(),
            input_transcription: config.input_transcription,
            output_transcription: config.output_transcription,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_subject_parsing() {
        assert_eq!("aia".parse::<Subject>().unwrap(), Subject::EnvironmentalImpact);
        assert_eq!(" EIA ".parse::<Subject>().unwrap(), Subject::EnvironmentalImpact);
        assert_eq!("Bioethics".parse::<Subject>().unwrap(), Subject::Bioethics);
        assert!("chemistry".parse::<Subject>().is_err());
    }

    #[test]
    fn test_each_subject_has_its_voice() {
        assert_eq!(Subject::EnvironmentalImpact.persona().voice_id, "Kore");
        assert_eq!(Subject::Bioethics.persona().voice_id, "Puck");
        assert!(Subject::Bioethics.persona().instruction.contains("Sofia"));
    }

    #[test]
    fn test_session_setup_follows_config() {
        let mut config = AppConfig::default();
        config.session.output_transcription = false;

        let setup = Subject::EnvironmentalImpact
            .persona()
            .session_setup(&config.session);
        assert_eq!(setup.voice_id, "Kore");
        assert!(setup.input_transcription);
        assert!(!setup.output_transcription);
        assert!(setup.system_instruction.starts_with("You are Dra. Gaia"));
    }
}
