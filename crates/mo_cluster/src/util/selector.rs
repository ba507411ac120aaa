use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Renders a selector in the `labelSelector` query syntax understood by the apiserver
pub fn to_selector_string(selector: &LabelSelector) -> String {
    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        terms.push(match expr.operator.as_str() {
            "In" => format!("{} in ({values})", expr.key),
            "NotIn" => format!("{} notin ({values})", expr.key),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            _ => continue,
        });
    }
    terms.join(",")
}

/// Evaluates a selector against a label set; an empty selector matches everything
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    if !labels_ok {
        return false;
    }
    selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        let current = labels.get(&expr.key);
        match expr.operator.as_str() {
            "In" => current.is_some_and(|v| values.contains(v)),
            "NotIn" => !current.is_some_and(|v| values.contains(v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn selector() -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(&[("tenant", "gold")])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "zone".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["a".to_string(), "b".to_string()]),
            }]),
        }
    }

    #[test]
    fn selector_string() {
        assert_eq!(to_selector_string(&selector()), "tenant=gold,zone in (a,b)");
        assert_eq!(to_selector_string(&LabelSelector::default()), "");
    }

    #[test]
    fn local_matching() {
        assert!(matches(&selector(), &labels(&[("tenant", "gold"), ("zone", "a")])));
        assert!(!matches(&selector(), &labels(&[("tenant", "gold"), ("zone", "c")])));
        assert!(!matches(&selector(), &labels(&[("zone", "a")])));
        assert!(matches(&LabelSelector::default(), &labels(&[])));
    }
}
