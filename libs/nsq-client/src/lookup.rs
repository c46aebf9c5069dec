use serde::Deserialize;

use crate::error::NsqError;

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// nsqlookupd >= 1.0 answers with the producers at the top level, older
/// releases wrap them in `{"status_code": 200, "data": {...}}`.
#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(default)]
    producers: Vec<Producer>,
    #[serde(default)]
    data: Option<LookupData>,
}

pub(crate) fn lookup_url(addr: &str) -> String {
    let base = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr.trim_end_matches('/'))
    };
    format!("{base}/lookup")
}

/// Extract `host:port` TCP addresses of the producers of a topic.
pub(crate) fn parse_lookup_body(addr: &str, body: &[u8]) -> Result<Vec<String>, NsqError> {
    let parsed: LookupBody = serde_json::from_slice(body).map_err(|e| NsqError::Lookup {
        addr: addr.to_string(),
        detail: format!("bad response: {e}"),
    })?;

    let producers = if parsed.producers.is_empty() {
        parsed.data.unwrap_or_default().producers
    } else {
        parsed.producers
    };

    Ok(producers
        .into_iter()
        .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
        .collect())
}

/// Ask one nsqlookupd for the nsqd nodes carrying `topic`.
///
/// An unknown topic (404) is not an error: nobody has published to it yet.
pub(crate) async fn query_lookupd(
    http: &reqwest::Client,
    addr: &str,
    topic: &str,
) -> Result<Vec<String>, NsqError> {
    let lookup_err = |detail: String| NsqError::Lookup { addr: addr.to_string(), detail };

    let resp = http
        .get(lookup_url(addr))
        .query(&[("topic", topic)])
        .header("Accept", "application/vnd.nsq; version=1.0")
        .send()
        .await
        .map_err(|e| lookup_err(e.to_string()))?;

    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Ok(Vec::new());
    }
    let body = resp.bytes().await.map_err(|e| lookup_err(e.to_string()))?;
    if !status.is_success() {
        return Err(lookup_err(format!("{status}: {}", String::from_utf8_lossy(&body))));
    }
    parse_lookup_body(addr, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_lookup_url() {
        assert_eq!(lookup_url("lookupA:4161"), "http://lookupA:4161/lookup");
        assert_eq!(lookup_url("https://lookup.internal/"), "https://lookup.internal/lookup");
    }

    #[test]
    fn parses_current_response_format() {
        let body = br#"{"channels":["w"],"producers":[
            {"remote_address":"10.0.0.1:51000","hostname":"n1","broadcast_address":"nsqd-1","tcp_port":4150,"http_port":4151,"version":"1.2.1"},
            {"broadcast_address":"nsqd-2","tcp_port":4250}
        ]}"#;
        assert_eq!(
            parse_lookup_body("l", body).unwrap(),
            vec!["nsqd-1:4150".to_string(), "nsqd-2:4250".to_string()]
        );
    }

    #[test]
    fn parses_legacy_wrapped_format() {
        let body = br#"{"status_code":200,"status_txt":"OK","data":{"channels":[],"producers":[
            {"broadcast_address":"old-nsqd","tcp_port":4150}
        ]}}"#;
        assert_eq!(parse_lookup_body("l", body).unwrap(), vec!["old-nsqd:4150".to_string()]);
    }

    #[test]
    fn garbage_is_a_lookup_error() {
        assert!(matches!(
            parse_lookup_body("l", b"<html>"),
            Err(NsqError::Lookup { .. })
        ));
    }
}
