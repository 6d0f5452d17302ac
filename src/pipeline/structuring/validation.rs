use serde_json::Value;

use crate::pipeline::safety::policy::SaveOfferPolicy;

/// Whether the UI may offer to save this reply as a journal entry.
///
/// Requires two independent signals from the structured data: an elevated
/// emotion rating in any configured signal field AND a non-empty action-item
/// list in any configured action field. Either alone is not enough.
pub fn should_offer_save(data: &Value, policy: &SaveOfferPolicy) -> bool {
    let Some(obj) = data.as_object() else {
        return false;
    };

    let emotion_elevated = policy
        .emotion_signal_fields
        .iter()
        .filter_map(|field| obj.get(field))
        .any(|v| is_elevated(v, policy.min_emotion_intensity));

    let has_action_items = policy
        .action_item_fields
        .iter()
        .filter_map(|field| obj.get(field))
        .any(has_items);

    if emotion_elevated != has_action_items {
        tracing::debug!(
            emotion_elevated,
            has_action_items,
            "Save offer withheld: only one signal present"
        );
    }

    emotion_elevated && has_action_items
}

/// Ratings arrive as a number, a numeric string, a flag, or a map/list of
/// those (`{"anxiety": 8, "sadness": 3}`). Any elevated entry counts.
fn is_elevated(value: &Value, threshold: f64) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(|x| x >= threshold),
        Value::String(s) => s.trim().parse::<f64>().is_ok_and(|x| x >= threshold),
        Value::Bool(b) => *b,
        Value::Array(items) => items.iter().any(|v| is_elevated(v, threshold)),
        Value::Object(map) => map.values().any(|v| is_elevated(v, threshold)),
        Value::Null => false,
    }
}

fn has_items(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        }),
        Value::Object(map) => !map.is_empty(),
        Value::String(s) => !s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> SaveOfferPolicy {
        SaveOfferPolicy::default()
    }

    #[test]
    fn both_signals_offer_save() {
        let data = json!({
            "emotion_ratings": {"anxiety": 8, "sadness": 2},
            "homework": ["Thought record"]
        });
        assert!(should_offer_save(&data, &policy()));
    }

    #[test]
    fn emotion_alone_is_not_enough() {
        let data = json!({"emotion_ratings": {"anxiety": 9}});
        assert!(!should_offer_save(&data, &policy()));
    }

    #[test]
    fn homework_alone_is_not_enough() {
        let data = json!({"homework": ["Walk for 10 minutes"]});
        assert!(!should_offer_save(&data, &policy()));
    }

    #[test]
    fn low_emotion_with_homework_not_offered() {
        let data = json!({"anxiety_level": 3, "action_items": ["Call a friend"]});
        assert!(!should_offer_save(&data, &policy()));
    }

    #[test]
    fn empty_action_list_not_offered() {
        let data = json!({"distress_level": "9", "homework": [null, "  "]});
        assert!(!should_offer_save(&data, &policy()));
    }

    #[test]
    fn alternate_configured_fields_count() {
        let data = json!({"distress_level": "7.5", "action_items": [{"title": "Journal"}]});
        assert!(should_offer_save(&data, &policy()));
    }

    #[test]
    fn custom_field_names_respected() {
        let custom = SaveOfferPolicy {
            emotion_signal_fields: vec!["mood_score".into()],
            action_item_fields: vec!["next_steps".into()],
            min_emotion_intensity: 5.0,
        };
        let data = json!({"mood_score": 6, "next_steps": ["Rest"]});
        assert!(should_offer_save(&data, &custom));
        // Default field names are not consulted under a custom policy.
        let default_shaped = json!({"emotion_ratings": 9, "homework": ["Rest"]});
        assert!(!should_offer_save(&default_shaped, &custom));
    }

    #[test]
    fn non_object_never_offers() {
        assert!(!should_offer_save(&Value::Null, &policy()));
        assert!(!should_offer_save(&json!([1, 2, 3]), &policy()));
    }
}
