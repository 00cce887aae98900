use std::collections::VecDeque;
use tracing::debug;

use crate::config::CommentaryConfig;
use crate::rate_limit::{IMAGE_TOKEN_ESTIMATE, estimate_tokens};
use crate::scene::{PersonInfo, SceneDescriptor};

pub const NO_ACTIVITY_SENTENCE: &str = "No people or notable activity detected in the scene.";
pub const SCENIC_EMPTY_SENTENCE: &str = "A quiet scene with no people or notable objects in view.";

/// What gets sent to the language model for one scene.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptionRequest {
    pub system: String,
    pub prompt: String,
    /// Base64 JPEG, without a data-URL prefix.
    pub image_base64: Option<String>,
}

impl DescriptionRequest {
    pub fn estimated_tokens(&self) -> u32 {
        let image = if self.image_base64.is_some() { IMAGE_TOKEN_ESTIMATE } else { 0 };
        estimate_tokens(&self.system) + estimate_tokens(&self.prompt) + image
    }
}

/// Most recent model descriptions, oldest first.
#[derive(Debug, Clone)]
pub struct CommentaryHistory {
    entries: VecDeque<String>,
    max_entries: usize,
}

impl CommentaryHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
        }
    }

    pub fn push(&mut self, description: impl Into<String>) {
        if self.max_entries == 0 {
            return;
        }
        self.entries.push_back(description.into());
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &String> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CommentaryFormatter {
    system_prompt: String,
    scenic_prompt: String,
}

impl CommentaryFormatter {
    pub fn new(system_prompt: impl Into<String>, scenic_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            scenic_prompt: scenic_prompt.into(),
        }
    }

    pub fn from_config(config: &CommentaryConfig) -> Self {
        Self::new(config.system_prompt.clone(), config.scenic_prompt.clone())
    }

    pub fn build_request(&self, descriptor: &SceneDescriptor, history: &CommentaryHistory) -> DescriptionRequest {
        let system = if descriptor.is_scenic {
            self.scenic_prompt.clone()
        } else {
            self.system_prompt.clone()
        };

        let mut prompt = String::new();
        prompt.push_str("CURRENT SCENE:\n");
        prompt.push_str(&format_scene(descriptor));

        if !history.is_empty() {
            prompt.push_str("\nRECENT COMMENTARY:\n");
            for entry in history.entries() {
                prompt.push_str(&format!("- {}\n", entry));
            }
        }

        prompt.push_str("\nREQUIRED OUTPUT:\n");
        if descriptor.is_scenic {
            prompt.push_str("Describe the scenery in two or three sentences.");
        } else {
            prompt.push_str("Describe what is happening in two or three sentences. Mention every person and every alert.");
        }
        if descriptor.frame.is_some() {
            prompt.push_str(" The attached image is the frame these facts were taken from.");
        }

        debug!("Built description prompt with {} characters", prompt.len());

        DescriptionRequest {
            system,
            prompt,
            image_base64: descriptor.frame.clone(),
        }
    }
}

fn format_scene(descriptor: &SceneDescriptor) -> String {
    let mut context = String::new();

    if descriptor.people.is_empty() {
        context.push_str("No people in view.\n");
    } else {
        context.push_str(&format!("People in view ({}):\n", descriptor.people.len()));
        for (i, person) in descriptor.people.iter().enumerate() {
            context.push_str(&format!(
                "- Person {}: age {}, expression {} (face confidence {:.2}); {} {}; {}",
                i + 1,
                person.annotation.age_range,
                person.annotation.expression,
                person.annotation.confidence,
                person.pose,
                person.position,
                person.movement,
            ));
            if let Some(activity) = &person.activity {
                context.push_str(&format!("; activity: {}", activity));
            }
            if let Some(alert) = &person.annotation.alert {
                context.push_str(&format!("; ALERT: {}", alert));
            }
            context.push('\n');
        }
    }

    if descriptor.objects.is_empty() {
        context.push_str("No other objects detected.\n");
    } else {
        context.push_str(&format!("Objects: {}\n", descriptor.objects.join(", ")));
    }

    context
}

fn person_sentence(person: &PersonInfo) -> String {
    let mut sentence = format!(
        "A person ({}, {}) is {} {}, {}",
        person.annotation.age_range,
        person.annotation.expression,
        person.pose,
        person.position,
        person.movement.clause(),
    );
    if let Some(activity) = &person.activity {
        sentence.push_str(&format!(", while {}", activity));
    }
    sentence.push('.');
    if let Some(alert) = &person.annotation.alert {
        sentence.push_str(&format!(" Alert: {}.", alert));
    }
    sentence
}

fn join_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

/// Deterministic description carrying the same facts as the model prompt.
pub fn fallback_description(descriptor: &SceneDescriptor) -> String {
    if descriptor.is_empty() {
        return if descriptor.is_scenic {
            SCENIC_EMPTY_SENTENCE.to_string()
        } else {
            NO_ACTIVITY_SENTENCE.to_string()
        };
    }

    let mut sentences: Vec<String> = descriptor.people.iter().map(person_sentence).collect();
    if !descriptor.objects.is_empty() {
        sentences.push(format!("Nearby objects include {}.", join_list(&descriptor.objects)));
    }
    sentences.join(" ")
}
