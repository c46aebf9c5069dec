use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

use serde::Deserialize;

/// Function entry as listed by `GET /system/functions`.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionStatus {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub annotations: Option<HashMap<String, String>>,
}

impl FunctionStatus {
    /// Name used in `/function/{name}`; namespaced as `name.namespace`.
    pub fn qualified_name(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}.{ns}", self.name),
            _ => self.name.clone(),
        }
    }
}

/// Build topic → functions from each function's `topic` annotation.
pub fn build_topic_map(
    functions: &[FunctionStatus],
    delimiter: &str,
) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for function in functions {
        let Some(topics) = function.annotations.as_ref().and_then(|a| a.get("topic")) else {
            continue;
        };
        let name = function.qualified_name();
        for topic in topics.split(delimiter).map(str::trim).filter(|t| !t.is_empty()) {
            let entry = map.entry(topic.to_string()).or_default();
            if !entry.contains(&name) {
                entry.push(name.clone());
            }
        }
    }
    map
}

/// Shared topic → functions lookup, swapped wholesale on every rebuild.
#[derive(Debug, Default)]
pub struct TopicMap {
    lookup: RwLock<HashMap<String, Vec<String>>>,
}

impl TopicMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<String>>> {
        match self.lookup.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("topic map read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn match_topic(&self, topic: &str) -> Vec<String> {
        self.read().get(topic).cloned().unwrap_or_default()
    }

    pub fn sync(&self, map: HashMap<String, Vec<String>>) {
        let mut guard = match self.lookup.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("topic map write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = map;
    }

    pub fn topics(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str, topic: Option<&str>) -> FunctionStatus {
        FunctionStatus {
            name: name.into(),
            namespace: None,
            annotations: topic.map(|t| HashMap::from([("topic".to_string(), t.to_string())])),
        }
    }

    #[test]
    fn splits_and_trims_annotations() {
        let functions = vec![
            function("fn-orders", Some("orders, payments")),
            function("fn-audit", Some("payments")),
            function("fn-unrouted", None),
        ];
        let map = build_topic_map(&functions, ",");

        assert_eq!(map["orders"], vec!["fn-orders".to_string()]);
        assert_eq!(map["payments"], vec!["fn-orders".to_string(), "fn-audit".to_string()]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn honours_custom_delimiter() {
        let functions = vec![function("fn", Some("a|b,c"))];
        let map = build_topic_map(&functions, "|");
        assert!(map.contains_key("a"));
        assert!(map.contains_key("b,c"));
    }

    #[test]
    fn namespaced_functions_are_qualified() {
        let mut f = function("fn", Some("orders"));
        f.namespace = Some("openfaas-fn".into());
        let map = build_topic_map(&[f], ",");
        assert_eq!(map["orders"], vec!["fn.openfaas-fn".to_string()]);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let topic_map = std::sync::Arc::new(TopicMap::new());
        topic_map.sync(HashMap::from([("a".to_string(), vec!["f1".to_string()])]));

        let poisoner = topic_map.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lookup.write().unwrap();
            panic!("poison the topic map");
        })
        .join();
        assert!(topic_map.lookup.is_poisoned());

        assert_eq!(topic_map.match_topic("a"), vec!["f1".to_string()]);
        assert_eq!(topic_map.topics(), vec!["a".to_string()]);
        topic_map.sync(HashMap::new());
        assert!(topic_map.topics().is_empty());
    }

    #[test]
    fn sync_replaces_whole_map() {
        let topic_map = TopicMap::new();
        topic_map.sync(HashMap::from([("a".to_string(), vec!["f1".to_string()])]));
        topic_map.sync(HashMap::from([("b".to_string(), vec!["f2".to_string()])]));

        assert!(topic_map.match_topic("a").is_empty());
        assert_eq!(topic_map.match_topic("b"), vec!["f2".to_string()]);
        assert_eq!(topic_map.topics(), vec!["b".to_string()]);
    }
}
