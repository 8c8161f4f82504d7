use std::collections::BTreeMap;

/// Render a label map as a selector. Empty values become existence checks.
pub(crate) fn format_label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<String>>()
        .join(",")
}

pub(crate) fn format_field_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_with_existence_check() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), String::new());
        assert_eq!(format_label_selector(&labels), "app=web,tier");
    }

    #[test]
    fn test_field_selector() {
        let mut fields = BTreeMap::new();
        fields.insert("status.phase".to_string(), "Running".to_string());
        fields.insert("metadata.name".to_string(), "a".to_string());
        assert_eq!(
            format_field_selector(&fields),
            "metadata.name=a,status.phase=Running"
        );
    }
}
