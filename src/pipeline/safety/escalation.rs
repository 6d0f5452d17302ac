//! Crisis escalation: maps a positive classification to the safety UI state.
//!
//! A triggered classification short-circuits the turn. The user's text is
//! never forwarded to the agent; the chat shows a supportive message with
//! pointers to immediate help instead.

use serde::{Deserialize, Serialize};

use super::types::CrisisClassification;
use crate::models::CrisisReason;

/// How prominently the safety UI presents the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationSeverity {
    /// Possible risk to life right now. Full safety panel.
    Emergency,
    /// Risk of harm. Safety panel above the conversation.
    Urgent,
    /// Distress without a specific risk signal. Inline banner.
    Advisory,
}

/// What the safety UI shows instead of forwarding the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisResponse {
    pub reason: CrisisReason,
    pub severity: EscalationSeverity,
    /// Localized supportive message.
    pub message: String,
    /// Whether the agent reply is suppressed entirely for this turn.
    pub replaces_reply: bool,
}

/// Build the safety response for a classification. `None` when not triggered.
pub fn crisis_response(classification: &CrisisClassification, lang: &str) -> Option<CrisisResponse> {
    if !classification.triggered {
        return None;
    }

    let severity = severity_for(classification.reason_code);
    let key = message_key(severity);

    tracing::warn!(
        reason = %classification.reason_code,
        severity = ?severity,
        layer = ?classification.layer,
        "Crisis escalation issued"
    );

    Some(CrisisResponse {
        reason: classification.reason_code,
        severity,
        message: escalation_message(key, lang).to_string(),
        replaces_reply: severity != EscalationSeverity::Advisory,
    })
}

fn severity_for(reason: CrisisReason) -> EscalationSeverity {
    match reason {
        CrisisReason::Suicide | CrisisReason::Overdose | CrisisReason::ImmediateDanger => {
            EscalationSeverity::Emergency
        }
        CrisisReason::SelfHarm => EscalationSeverity::Urgent,
        // A triggered result always carries a reason; `None` here means an
        // upstream layer fired without one, which still resolves toward safety.
        CrisisReason::GeneralCrisis | CrisisReason::None => EscalationSeverity::Advisory,
    }
}

fn message_key(severity: EscalationSeverity) -> &'static str {
    match severity {
        EscalationSeverity::Emergency => "safety.crisis.emergency",
        EscalationSeverity::Urgent => "safety.crisis.urgent",
        EscalationSeverity::Advisory => "safety.crisis.advisory",
    }
}

// ── I18n messages ───────────────────────────────────────────

fn escalation_message(key: &str, lang: &str) -> &'static str {
    match (key, lang) {
        ("safety.crisis.emergency", "fr") =>
            "Ce que vous traversez semble très douloureux, et vous n'êtes pas seul·e. Si vous êtes en danger immédiat, appelez maintenant le numéro d'urgence local ou une ligne d'écoute de crise. Vous méritez de l'aide tout de suite.",
        ("safety.crisis.emergency", "he") =>
            "נשמע שעובר עליך משהו כואב מאוד, ואינך לבד. אם את/ה בסכנה מיידית, התקשר/י עכשיו למספר החירום המקומי או לקו סיוע למצבי משבר. מגיעה לך עזרה כבר עכשיו.",
        ("safety.crisis.emergency", _) =>
            "It sounds like you're going through something really painful, and you don't have to face it alone. If you are in immediate danger, please call your local emergency number or a crisis line now. You deserve support right away.",

        ("safety.crisis.urgent", "fr") =>
            "Merci de me l'avoir confié. Vous faire du mal est un signe que vous portez beaucoup en ce moment. Pouvez-vous contacter dès aujourd'hui une personne de confiance ou une ligne d'écoute de crise ?",
        ("safety.crisis.urgent", "he") =>
            "תודה ששיתפת אותי. פגיעה עצמית היא סימן לכך שאת/ה נושא/ת הרבה כרגע. האם תוכל/י לפנות היום לאדם שאת/ה סומך/ת עליו או לקו סיוע למצבי משבר?",
        ("safety.crisis.urgent", _) =>
            "Thank you for telling me. Hurting yourself is a sign that you're carrying a lot right now. Could you reach out today to someone you trust or to a crisis line?",

        ("safety.crisis.advisory", "fr") =>
            "On dirait que les choses sont vraiment lourdes en ce moment. Si cela devient trop, une ligne d'écoute de crise peut vous aider à tout moment. Je suis là pour continuer à en parler.",
        ("safety.crisis.advisory", "he") =>
            "נשמע שהדברים ממש כבדים כרגע. אם זה נהיה יותר מדי, קו סיוע למצבי משבר זמין בכל שעה. אני כאן כדי להמשיך לדבר על זה.",
        ("safety.crisis.advisory", _) =>
            "It sounds like things feel really heavy right now. If it becomes too much, a crisis line is available any time. I'm here to keep talking this through with you.",

        (_, _) =>
            "If you are in immediate danger, please contact your local emergency number.",
    }
}
