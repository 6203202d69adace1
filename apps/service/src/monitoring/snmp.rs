use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout as deadline;

use super::checker::{Checker, classify};
use super::secrets;
use super::types::{Details, Outcome, Params, int_param, millis};

pub const DEFAULT_SNMP_PORT: u16 = 161;

/// sysUpTime.0 and sysName.0
pub const DEFAULT_OIDS: [&str; 2] = ["1.3.6.1.2.1.1.3.0", "1.3.6.1.2.1.1.5.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Md5,
    Sha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivProtocol {
    Des,
    Aes,
}

impl AuthProtocol {
    /// `None` for `NONE`; unrecognised names fall back to SHA
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "NONE" => None,
            "MD5" => Some(AuthProtocol::Md5),
            _ => Some(AuthProtocol::Sha),
        }
    }
}

impl PrivProtocol {
    /// `None` for `NONE`; unrecognised names fall back to AES-128
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "NONE" => None,
            "DES" => Some(PrivProtocol::Des),
            _ => Some(PrivProtocol::Aes),
        }
    }
}

/// One SNMPv3 GET with user-based security
#[derive(Clone)]
pub struct SnmpQuery {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: Option<(AuthProtocol, String)>,
    pub privacy: Option<(PrivProtocol, String)>,
    pub oids: Vec<String>,
}

// Keys stay out of debug output
impl std::fmt::Debug for SnmpQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnmpQuery")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth", &self.auth.as_ref().map(|(proto, _)| proto))
            .field("privacy", &self.privacy.as_ref().map(|(proto, _)| proto))
            .field("oids", &self.oids)
            .finish_non_exhaustive()
    }
}

/// Agent answer. A nonzero `error_status` means the agent replied but
/// refused part of the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnmpResponse {
    pub error_status: u32,
    pub error_index: u32,
    pub values: Vec<(String, String)>,
}

/// Wire side of the SNMP check
#[async_trait::async_trait]
pub trait SnmpTransport: Send + Sync {
    /// `Err` is an error indication (timeout, unknown user, bad keys): no usable reply
    async fn get(&self, query: &SnmpQuery, timeout: Duration) -> Result<SnmpResponse, String>;
}

/// Names of the SNMP PDU error-status codes
fn error_status_name(code: u32) -> &'static str {
    match code {
        1 => "tooBig",
        2 => "noSuchName",
        3 => "badValue",
        4 => "readOnly",
        5 => "genErr",
        6 => "noAccess",
        7 => "wrongType",
        8 => "wrongLength",
        9 => "wrongEncoding",
        10 => "wrongValue",
        11 => "noCreation",
        12 => "inconsistentValue",
        13 => "resourceUnavailable",
        14 => "commitFailed",
        15 => "undoFailed",
        16 => "authorizationError",
        17 => "notWritable",
        18 => "inconsistentName",
        _ => "unknownError",
    }
}

/// Parse dotted numeric OID notation
pub fn parse_oid(raw: &str) -> Option<Vec<u64>> {
    let arcs: Vec<u64> = raw.trim().trim_start_matches('.').split('.').map(|arc| arc.parse().ok()).collect::<Option<_>>()?;
    (arcs.len() >= 2).then_some(arcs)
}

/// SNMPv3 GET of a handful of OIDs
pub struct SnmpV3Checker {
    transport: Arc<dyn SnmpTransport>,
    degraded_threshold: Duration,
}

impl SnmpV3Checker {
    pub fn new(degraded_threshold: Duration) -> Self {
        Self::with_transport(Arc::new(Snmp2Transport), degraded_threshold)
    }

    pub fn with_transport(transport: Arc<dyn SnmpTransport>, degraded_threshold: Duration) -> Self {
        Self { transport, degraded_threshold }
    }

    fn query(target: &str, params: &Params) -> Result<SnmpQuery, String> {
        let port = match int_param(params, "port") {
            None => DEFAULT_SNMP_PORT,
            Some(port) => u16::try_from(port).ok().filter(|p| *p != 0).ok_or("invalid 'port' param")?,
        };

        let secret = |key: &str| secrets::param(params, key).map_err(|e| e.to_string());
        let username = secret("username")?.unwrap_or_default();
        if username.is_empty() {
            return Err("missing username".into());
        }
        let auth_key = secret("auth_key")?.filter(|k| !k.is_empty());
        let priv_key = secret("priv_key")?.filter(|k| !k.is_empty());

        let proto = |key: &str, fallback: &'static str| {
            params.get(key).and_then(Value::as_str).unwrap_or(fallback).to_string()
        };
        let auth = auth_key.and_then(|key| AuthProtocol::parse(&proto("auth_proto", "SHA")).map(|p| (p, key)));
        let privacy = priv_key.and_then(|key| PrivProtocol::parse(&proto("priv_proto", "AES")).map(|p| (p, key)));
        if privacy.is_some() && auth.is_none() {
            return Err("privacy requires an auth_key".into());
        }
        if params.get("context_name").and_then(Value::as_str).is_some_and(|name| !name.is_empty()) {
            return Err("only the default SNMP context is supported".into());
        }

        let oids = match params.get("oids").and_then(Value::as_array) {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|oid| oid.as_str().map(str::to_string).ok_or("'oids' must be strings"))
                .collect::<Result<Vec<_>, _>>()?,
            _ => DEFAULT_OIDS.iter().map(ToString::to_string).collect(),
        };

        Ok(SnmpQuery { host: target.trim().to_string(), port, username, auth, privacy, oids })
    }
}

#[async_trait::async_trait]
impl Checker for SnmpV3Checker {
    fn kind(&self) -> &str {
        "snmpv3_get"
    }

    async fn run(&self, target: &str, timeout: Duration, params: &Params) -> Outcome {
        let query = match Self::query(target, params) {
            Ok(query) => query,
            Err(e) => return Outcome::down(e),
        };

        let start = Instant::now();
        let response = match deadline(timeout, self.transport.get(&query, timeout)).await {
            Err(_) => return Outcome::down("SNMP request timed out").with_detail("port", query.port),
            Ok(Err(indication)) => return Outcome::down(indication).with_detail("port", query.port),
            Ok(Ok(response)) => response,
        };
        let latency = start.elapsed();

        let mut details = Details::new();
        details.insert("port".into(), query.port.into());

        if response.error_status != 0 {
            let error = format!("{} at {}", error_status_name(response.error_status), response.error_index);
            return Outcome::degraded(Some(millis(latency)), details).with_detail("error", error);
        }

        let values: Map<String, Value> =
            response.values.into_iter().map(|(oid, value)| (oid, Value::String(value))).collect();
        details.insert("values".into(), Value::Object(values));
        classify(latency, self.degraded_threshold, details)
    }
}

/// UDP transport backed by the `snmp2` client. Sessions are blocking, so
/// each query runs on the blocking pool with a socket timeout.
pub struct Snmp2Transport;

#[async_trait::async_trait]
impl SnmpTransport for Snmp2Transport {
    async fn get(&self, query: &SnmpQuery, timeout: Duration) -> Result<SnmpResponse, String> {
        let query = query.clone();
        tokio::task::spawn_blocking(move || blocking_get(&query, timeout))
            .await
            .map_err(|e| format!("SNMP worker failed: {e}"))?
    }
}

fn security(query: &SnmpQuery) -> snmp2::v3::Security {
    use snmp2::v3;

    let auth_password = query.auth.as_ref().map(|(_, key)| key.as_bytes()).unwrap_or_default();
    let security = v3::Security::new(query.username.as_bytes(), auth_password);
    let Some((auth_proto, _)) = &query.auth else {
        return security.with_auth(v3::Auth::NoAuthNoPriv);
    };

    let security = security.with_auth_protocol(match auth_proto {
        AuthProtocol::Md5 => v3::AuthProtocol::Md5,
        AuthProtocol::Sha => v3::AuthProtocol::Sha1,
    });
    match &query.privacy {
        None => security.with_auth(v3::Auth::AuthNoPriv),
        Some((priv_proto, key)) => security.with_auth(v3::Auth::AuthPriv {
            cipher: match priv_proto {
                PrivProtocol::Des => v3::Cipher::Des,
                PrivProtocol::Aes => v3::Cipher::Aes128,
            },
            privacy_password: key.as_bytes().to_vec(),
        }),
    }
}

fn render_value(value: &snmp2::Value<'_>) -> String {
    match value {
        snmp2::Value::OctetString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        snmp2::Value::Integer(n) => n.to_string(),
        snmp2::Value::Timeticks(ticks) => ticks.to_string(),
        other => format!("{other:?}"),
    }
}

fn fetch(session: &mut snmp2::SyncSession, oid: &snmp2::Oid<'_>) -> Result<SnmpResponse, snmp2::Error> {
    let pdu = session.get(oid)?;
    Ok(SnmpResponse {
        error_status: pdu.error_status as u32,
        error_index: pdu.error_index as u32,
        values: pdu.varbinds.map(|(name, value)| (name.to_string(), render_value(&value))).collect(),
    })
}

fn blocking_get(query: &SnmpQuery, timeout: Duration) -> Result<SnmpResponse, String> {
    let oids = query
        .oids
        .iter()
        .map(|raw| {
            let arcs = parse_oid(raw).ok_or_else(|| format!("invalid OID '{raw}'"))?;
            snmp2::Oid::from(&arcs).map_err(|_| format!("invalid OID '{raw}'"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let agent = (query.host.as_str(), query.port);
    let mut session = snmp2::SyncSession::new_v3(agent, Some(timeout), 0, security(query))
        .map_err(|e| format!("SNMP session failed: {e}"))?;
    session.init().map_err(|e| format!("SNMP engine discovery failed: {e}"))?;

    let mut merged = SnmpResponse::default();
    for oid in &oids {
        // The agent may refresh engine boots/time once after discovery
        let response = match fetch(&mut session, oid) {
            Err(snmp2::Error::AuthUpdated) => fetch(&mut session, oid),
            other => other,
        }
        .map_err(|e| e.to_string())?;

        if response.error_status != 0 {
            return Ok(SnmpResponse { values: merged.values, ..response });
        }
        merged.values.extend(response.values);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::Status;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays one canned answer and keeps the last query
    struct Canned {
        answer: Result<SnmpResponse, String>,
        seen: Mutex<Option<SnmpQuery>>,
    }

    impl Canned {
        fn checker(answer: Result<SnmpResponse, String>) -> (SnmpV3Checker, Arc<Canned>) {
            let canned = Arc::new(Canned { answer, seen: Mutex::new(None) });
            (SnmpV3Checker::with_transport(canned.clone(), Duration::from_secs(1)), canned)
        }
    }

    #[async_trait::async_trait]
    impl SnmpTransport for Canned {
        async fn get(&self, query: &SnmpQuery, _timeout: Duration) -> Result<SnmpResponse, String> {
            *self.seen.lock().unwrap() = Some(query.clone());
            self.answer.clone()
        }
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    fn ok_answer() -> Result<SnmpResponse, String> {
        Ok(SnmpResponse {
            error_status: 0,
            error_index: 0,
            values: vec![
                ("1.3.6.1.2.1.1.3.0".into(), "123456".into()),
                ("1.3.6.1.2.1.1.5.0".into(), "fw-edge".into()),
            ],
        })
    }

    #[tokio::test]
    async fn missing_username_is_down_without_a_request() {
        let (checker, canned) = Canned::checker(ok_answer());
        let outcome = checker.run("10.0.0.1", Duration::from_secs(1), &Params::new()).await;
        assert_eq!(outcome.status, Status::Down);
        assert_eq!(outcome.error(), Some("missing username"));
        assert!(canned.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn values_land_in_details() {
        let (checker, canned) = Canned::checker(ok_answer());
        let outcome = checker.run("10.0.0.1", Duration::from_secs(1), &params(json!({"username": "monitor"}))).await;

        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.details["port"], json!(161));
        assert_eq!(outcome.details["values"]["1.3.6.1.2.1.1.5.0"], json!("fw-edge"));

        let query = canned.seen.lock().unwrap().clone().unwrap();
        assert_eq!(query.oids, DEFAULT_OIDS.to_vec());
        assert_eq!(query.auth, None);
    }

    #[tokio::test]
    async fn error_status_is_degraded() {
        let answer = Ok(SnmpResponse { error_status: 2, error_index: 1, values: vec![] });
        let (checker, _) = Canned::checker(answer);
        let outcome = checker
            .run("10.0.0.1", Duration::from_secs(1), &params(json!({"username": "monitor", "port": 1161})))
            .await;

        assert_eq!(outcome.status, Status::Degraded);
        assert!(outcome.latency_ms.is_some());
        assert_eq!(outcome.error(), Some("noSuchName at 1"));
        assert_eq!(outcome.details["port"], json!(1161));
    }

    #[tokio::test]
    async fn error_indication_is_down() {
        let (checker, _) = Canned::checker(Err("unknown user name".into()));
        let outcome = checker.run("10.0.0.1", Duration::from_secs(1), &params(json!({"username": "monitor"}))).await;

        assert_eq!(outcome.status, Status::Down);
        assert_eq!(outcome.latency_ms, None);
        assert_eq!(outcome.error(), Some("unknown user name"));
    }

    #[tokio::test]
    async fn keys_are_resolved_and_protocols_picked() {
        let (checker, canned) = Canned::checker(ok_answer());
        let p = params(json!({
            "username": "monitor",
            "auth_key": "authpass1",
            "auth_proto": "md5",
            "priv_key": "privpass1",
            "priv_proto": "DES",
            "oids": ["1.3.6.1.2.1.1.1.0"],
        }));
        checker.run("10.0.0.1", Duration::from_secs(1), &p).await;

        let query = canned.seen.lock().unwrap().clone().unwrap();
        assert_eq!(query.auth, Some((AuthProtocol::Md5, "authpass1".to_string())));
        assert_eq!(query.privacy, Some((PrivProtocol::Des, "privpass1".to_string())));
        assert_eq!(query.oids, vec!["1.3.6.1.2.1.1.1.0".to_string()]);
        assert!(!format!("{query:?}").contains("privpass1"));
    }

    #[tokio::test]
    async fn unresolved_key_is_down() {
        let (checker, canned) = Canned::checker(ok_answer());
        let p = params(json!({"username": "monitor", "auth_key": "env:NETDASH_TEST_UNSET_SNMP_AUTH"}));
        let outcome = checker.run("10.0.0.1", Duration::from_secs(1), &p).await;

        assert_eq!(outcome.status, Status::Down);
        assert!(outcome.error().unwrap().contains("NETDASH_TEST_UNSET_SNMP_AUTH"));
        assert!(canned.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn named_context_is_refused() {
        let (checker, canned) = Canned::checker(ok_answer());
        let p = params(json!({"username": "monitor", "context_name": "vlan-20"}));
        let outcome = checker.run("10.0.0.1", Duration::from_secs(1), &p).await;

        assert_eq!(outcome.status, Status::Down);
        assert!(canned.seen.lock().unwrap().is_none());
    }

    #[test]
    fn oids_are_dotted_numbers() {
        assert_eq!(parse_oid("1.3.6.1.2.1.1.5.0"), Some(vec![1, 3, 6, 1, 2, 1, 1, 5, 0]));
        assert_eq!(parse_oid(".1.3.6"), Some(vec![1, 3, 6]));
        assert_eq!(parse_oid("sysName.0"), None);
        assert_eq!(parse_oid("1"), None);
    }
}
