//! Reader overlay layout.
//!
//! A pure function of (page, settings, interaction state) that decides what
//! each text bubble shows: the target-language text inside the bubble and an
//! optional popup with the native-language text and grammar notes. Geometry
//! is expressed in percent of the page.

use crate::models::UserPreferences;
use serde::{Deserialize, Serialize};

/// Text of a bubble in one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub language_code: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar_notes: Option<String>,
}

/// A rectangular page region in percent coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBubble {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub translations: Vec<Translation>,
}

impl TextBubble {
    fn translation(&self, language_code: &str) -> Option<&Translation> {
        self.translations
            .iter()
            .find(|t| t.language_code == language_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub image_url: String,
    #[serde(default)]
    pub bubbles: Vec<TextBubble>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderSettings {
    pub native_language: String,
    pub target_language: String,
    pub show_translations: bool,
    pub show_grammar_notes: bool,
    pub auto_play_translations: bool,
}

impl ReaderSettings {
    /// Settings for reading `target_language` with the user's stored
    /// preferences; the preferred language is the native one.
    pub fn from_preferences(preferences: &UserPreferences, target_language: &str) -> Self {
        Self {
            native_language: preferences.default_language.clone(),
            target_language: target_language.to_string(),
            show_translations: preferences.show_translations,
            show_grammar_notes: preferences.show_grammar_notes,
            auto_play_translations: preferences.auto_play_translations,
        }
    }
}

/// The only mutable reader state: which bubble the pointer is over
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionState {
    #[serde(default)]
    pub hovered_bubble: Option<String>,
}

impl InteractionState {
    pub fn pointer_enter(&mut self, bubble_id: impl Into<String>) {
        self.hovered_bubble = Some(bubble_id.into());
    }

    pub fn pointer_leave(&mut self) {
        self.hovered_bubble = None;
    }

    pub fn is_hovered(&self, bubble_id: &str) -> bool {
        self.hovered_bubble.as_deref() == Some(bubble_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    /// Clamp a bubble rectangle so it lies within the page
    fn clamped(bubble: &TextBubble) -> Self {
        let x = clamp_percent(bubble.x);
        let y = clamp_percent(bubble.y);
        Self {
            x,
            y,
            width: clamp_percent(bubble.width).min(100.0 - x),
            height: clamp_percent(bubble.height).min(100.0 - y),
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationPopup {
    pub native_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BubbleLayout {
    pub id: String,
    pub bounds: Bounds,
    pub target_text: Option<String>,
    pub popup: Option<TranslationPopup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageLayout {
    pub image_url: String,
    pub bubbles: Vec<BubbleLayout>,
}

/// Compute the visual layout of a page
pub fn render(page: &Page, settings: &ReaderSettings, state: &InteractionState) -> PageLayout {
    let bubbles = page
        .bubbles
        .iter()
        .map(|bubble| render_bubble(bubble, settings, state))
        .collect();

    PageLayout {
        image_url: page.image_url.clone(),
        bubbles,
    }
}

fn render_bubble(
    bubble: &TextBubble,
    settings: &ReaderSettings,
    state: &InteractionState,
) -> BubbleLayout {
    let target = bubble.translation(&settings.target_language);
    let native = bubble.translation(&settings.native_language);

    let popup_visible = settings.show_translations
        && (settings.auto_play_translations || state.is_hovered(&bubble.id));

    let popup = popup_visible.then(|| TranslationPopup {
        native_text: native.map(|t| t.text.clone()),
        grammar_notes: if settings.show_grammar_notes {
            target.and_then(|t| t.grammar_notes.clone())
        } else {
            None
        },
    });

    BubbleLayout {
        id: bubble.id.clone(),
        bounds: Bounds::clamped(bubble),
        target_text: target.map(|t| t.text.clone()),
        popup,
    }
}
