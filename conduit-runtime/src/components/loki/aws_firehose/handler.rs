// Firehose request handling
// Turns one HTTP delivery request into log entries, independent of the server

use crate::components::loki::aws_firehose::metrics::FirehoseMetrics;
use crate::components::loki::relabel::{self, RelabelRule};
use crate::components::loki::{
    drop_internal_labels, fanout, is_valid_label_name, sanitize_label_name, Entry, LabelSet,
    LogsReceiver, TENANT_LABEL,
};

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use hyper::header::{HeaderMap, CONTENT_ENCODING};
use hyper::StatusCode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const REQUEST_ID_HEADER: &str = "X-Amz-Firehose-Request-Id";
pub const SOURCE_ARN_HEADER: &str = "X-Amz-Firehose-Source-Arn";
pub const ACCESS_KEY_HEADER: &str = "X-Amz-Firehose-Access-Key";
pub const COMMON_ATTRIBUTES_HEADER: &str = "X-Amz-Firehose-Common-Attributes";
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

const STATIC_LABEL_PREFIX: &str = "lbl_";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Body of a Firehose HTTP delivery request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseRequest {
    pub request_id: String,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    #[serde(default)]
    pub records: Vec<FirehoseRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirehoseRecord {
    /// Base64-encoded payload
    pub data: String,
}

/// What Firehose expects back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseResponse {
    pub request_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// CloudWatch Logs subscription payload, gzipped inside a record
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudwatchLogsRecord {
    message_type: String,
    owner: String,
    log_group: String,
    log_stream: String,
    #[serde(default)]
    subscription_filters: Vec<String>,
    #[serde(default)]
    log_events: Vec<CloudwatchLogEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudwatchLogEvent {
    #[allow(dead_code)]
    id: String,
    timestamp: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CommonAttributes {
    #[serde(rename = "commonAttributes", default)]
    common_attributes: BTreeMap<String, String>,
}

/// Per-update settings of the handler
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    pub forward_to: Vec<Arc<LogsReceiver>>,
    pub relabel_rules: Vec<RelabelRule>,
    pub use_incoming_timestamp: bool,
    pub access_key: Option<String>,
}

/// Processes Firehose deliveries and forwards the resulting entries
pub struct Handler {
    config: RwLock<Arc<HandlerConfig>>,
    metrics: FirehoseMetrics,
}

impl Handler {
    pub fn new(config: HandlerConfig, metrics: FirehoseMetrics) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            metrics,
        }
    }

    pub fn update(&self, config: HandlerConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn metrics(&self) -> &FirehoseMetrics {
        &self.metrics
    }

    /// Handle one request; entries are forwarded before the response is returned
    pub async fn handle(&self, headers: &HeaderMap, body: Bytes) -> (StatusCode, FirehoseResponse) {
        let config = self.config.read().clone();
        let header_request_id = header(headers, REQUEST_ID_HEADER).unwrap_or_default();

        if let Some(expected) = config.access_key.as_deref().filter(|k| !k.is_empty()) {
            if header(headers, ACCESS_KEY_HEADER).as_deref() != Some(expected) {
                warn!(request_id = %header_request_id, "rejecting firehose request with invalid access key");
                self.metrics.batch_errors.with_label_values(&["access-key"]).inc();
                return reject(StatusCode::UNAUTHORIZED, header_request_id, "access key not provided or incorrect");
            }
        }

        let body = match decode_body(headers, body) {
            Ok(body) => body,
            Err(message) => {
                self.metrics.batch_errors.with_label_values(&["decompress"]).inc();
                return reject(StatusCode::BAD_REQUEST, header_request_id, message);
            }
        };

        let request: FirehoseRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "malformed firehose request body");
                self.metrics.batch_errors.with_label_values(&["json-decode"]).inc();
                return reject(StatusCode::BAD_REQUEST, header_request_id, format!("failed to decode request: {}", err));
            }
        };

        let entries = self.entries(&config, headers, &request);
        debug!(
            request_id = %request.request_id,
            records = request.records.len(),
            entries = entries.len(),
            "processed firehose request"
        );
        for entry in entries {
            fanout(&config.forward_to, entry).await;
        }

        (
            StatusCode::OK,
            FirehoseResponse {
                request_id: request.request_id,
                timestamp: Utc::now().timestamp_millis(),
                error_message: None,
            },
        )
    }

    /// Turn every record of `request` into entries, after relabeling
    pub fn entries(
        &self,
        config: &HandlerConfig,
        headers: &HeaderMap,
        request: &FirehoseRequest,
    ) -> Vec<Entry> {
        let tenant = header(headers, TENANT_HEADER).filter(|t| !t.is_empty());

        let mut base = LabelSet::new();
        if let Some(id) = header(headers, REQUEST_ID_HEADER) {
            base.insert("__aws_firehose_request_id".to_string(), id);
        }
        if let Some(arn) = header(headers, SOURCE_ARN_HEADER) {
            base.insert("__aws_firehose_source_arn".to_string(), arn);
        }
        if let Some(tenant) = &tenant {
            base.insert(TENANT_LABEL.to_string(), tenant.clone());
        }
        base.extend(self.static_labels(headers, tenant.as_deref().unwrap_or("")));

        let now = Utc::now();
        let mut entries = Vec::new();
        for record in &request.records {
            let data = match STANDARD.decode(record.data.as_bytes()) {
                Ok(data) => data,
                Err(err) => {
                    debug!(error = %err, "failed to decode firehose record");
                    self.metrics.record_errors.with_label_values(&["base64-decode"]).inc();
                    continue;
                }
            };

            if data.starts_with(&GZIP_MAGIC) {
                let Some(cw) = self.cloudwatch_record(&data) else {
                    continue;
                };
                self.metrics.records_received.with_label_values(&["cloudwatch"]).inc();

                let mut labels = base.clone();
                labels.insert("__aws_owner".to_string(), cw.owner);
                labels.insert("__aws_cw_log_group".to_string(), cw.log_group);
                labels.insert("__aws_cw_log_stream".to_string(), cw.log_stream);
                labels.insert(
                    "__aws_cw_matched_filters".to_string(),
                    cw.subscription_filters.join(","),
                );
                labels.insert("__aws_cw_msg_type".to_string(), cw.message_type);

                for event in cw.log_events {
                    let timestamp = if config.use_incoming_timestamp {
                        Utc.timestamp_millis_opt(event.timestamp).single().unwrap_or(now)
                    } else {
                        now
                    };
                    if let Some(entry) = finish(&labels, &config.relabel_rules, timestamp, event.message) {
                        entries.push(entry);
                    }
                }
            } else {
                self.metrics.records_received.with_label_values(&["direct_put"]).inc();
                let timestamp = if config.use_incoming_timestamp {
                    request_time(request.timestamp).unwrap_or(now)
                } else {
                    now
                };
                let line = String::from_utf8_lossy(&data).into_owned();
                if let Some(entry) = finish(&base, &config.relabel_rules, timestamp, line) {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    fn cloudwatch_record(&self, data: &[u8]) -> Option<CloudwatchLogsRecord> {
        let mut decompressed = Vec::new();
        if let Err(err) = GzDecoder::new(data).read_to_end(&mut decompressed) {
            debug!(error = %err, "failed to decompress cloudwatch record");
            self.metrics.record_errors.with_label_values(&["gzip-decode"]).inc();
            return None;
        }
        match serde_json::from_slice(&decompressed) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(error = %err, "failed to decode cloudwatch record");
                self.metrics.record_errors.with_label_values(&["cloudwatch-decode"]).inc();
                None
            }
        }
    }

    /// Labels from `X-Amz-Firehose-Common-Attributes`; only `lbl_` keys count.
    ///
    /// Bad input never fails the request: it is counted and skipped.
    pub fn static_labels(&self, headers: &HeaderMap, tenant: &str) -> LabelSet {
        let mut labels = LabelSet::new();
        let Some(raw) = headers.get(COMMON_ATTRIBUTES_HEADER) else {
            return labels;
        };

        let parsed = raw
            .to_str()
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(serde_json::from_str::<CommonAttributes>);
        let attributes = match parsed {
            Some(Ok(attributes)) => attributes.common_attributes,
            None if raw.as_bytes().iter().all(u8::is_ascii_whitespace) => return labels,
            _ => {
                self.metrics
                    .invalid_static_labels_errors
                    .with_label_values(&["invalid_json_format", tenant])
                    .inc();
                return labels;
            }
        };

        for (key, value) in attributes {
            let Some(name) = key.strip_prefix(STATIC_LABEL_PREFIX) else {
                continue;
            };
            let name = sanitize_label_name(name);
            if !is_valid_label_name(&name) {
                self.metrics
                    .invalid_static_labels_errors
                    .with_label_values(&["invalid_label_name", tenant])
                    .inc();
                continue;
            }
            labels.insert(name, value);
        }
        labels
    }
}

fn finish(
    labels: &LabelSet,
    rules: &[RelabelRule],
    timestamp: DateTime<Utc>,
    line: String,
) -> Option<Entry> {
    let mut labels = relabel::process(labels, rules)?;
    drop_internal_labels(&mut labels);
    Some(Entry::new(labels, timestamp, line))
}

/// Request timestamps are truncated to whole seconds
fn request_time(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(millis.div_euclid(1000), 0).single()
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, String> {
    let gzipped = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !gzipped {
        return Ok(body);
    }

    let mut decompressed = Vec::new();
    GzDecoder::new(body.as_ref())
        .read_to_end(&mut decompressed)
        .map_err(|err| format!("failed to decompress request body: {}", err))?;
    Ok(Bytes::from(decompressed))
}

fn reject(
    status: StatusCode,
    request_id: String,
    message: impl Into<String>,
) -> (StatusCode, FirehoseResponse) {
    (
        status,
        FirehoseResponse {
            request_id,
            timestamp: Utc::now().timestamp_millis(),
            error_message: Some(message.into()),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use hyper::header::HeaderValue;
    use tokio::sync::mpsc;

    const REQUEST_ID: &str = "86208cf6-2bcc-47e6-9010-02ca9f44a025";
    const SOURCE_ARN: &str = "arn:aws:firehose:us-east-2:123:deliverystream/test";
    const REQUEST_TS: i64 = 1684422829730;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn direct_put(lines: &[&str]) -> Bytes {
        let records: Vec<_> = lines
            .iter()
            .map(|l| serde_json::json!({ "data": STANDARD.encode(l) }))
            .collect();
        Bytes::from(
            serde_json::json!({ "requestId": REQUEST_ID, "timestamp": REQUEST_TS, "records": records })
                .to_string(),
        )
    }

    fn cloudwatch(message_type: &str, events: &[(i64, &str)]) -> Bytes {
        let log_events: Vec<_> = events
            .iter()
            .enumerate()
            .map(|(i, (ts, msg))| serde_json::json!({ "id": i.to_string(), "timestamp": ts, "message": msg }))
            .collect();
        let payload = serde_json::json!({
            "messageType": message_type,
            "owner": "366620023056",
            "logGroup": "/aws/lambda/logging-lambda",
            "logStream": "2023/05/18/[$LATEST]405d340d30f844c4ad376392489343f5",
            "subscriptionFilters": ["test_lambdafunction_logfilter"],
            "logEvents": log_events,
        });
        let data = STANDARD.encode(gzip(payload.to_string().as_bytes()));
        Bytes::from(
            serde_json::json!({
                "requestId": REQUEST_ID,
                "timestamp": REQUEST_TS,
                "records": [{ "data": data }, { "data": "%%% not base64 %%%" }],
            })
            .to_string(),
        )
    }

    fn headers(extra: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("header-request-id"));
        headers.insert(SOURCE_ARN_HEADER, HeaderValue::from_static(SOURCE_ARN));
        for (name, value) in extra {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn handler(config: HandlerConfig) -> (Handler, prometheus::Registry) {
        let registry = prometheus::Registry::new();
        let metrics = FirehoseMetrics::new(&registry, "loki.source.aws_firehose.test").unwrap();
        (Handler::new(config, metrics), registry)
    }

    fn with_receiver(mut config: HandlerConfig) -> (HandlerConfig, mpsc::Receiver<Entry>) {
        let (receiver, rx) = LogsReceiver::channel(64);
        config.forward_to = vec![Arc::new(receiver)];
        (config, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Entry>) -> Vec<Entry> {
        let mut entries = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    fn counter(registry: &prometheus::Registry, name: &str, label: (&str, &str)) -> u64 {
        registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == name)
            .flat_map(|f| f.get_metric().iter())
            .filter(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == label.0 && l.get_value() == label.1)
            })
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    #[tokio::test]
    async fn test_direct_put_records() {
        let (config, mut rx) = with_receiver(HandlerConfig::default());
        let (handler, _registry) = handler(config);

        let (status, response) = handler
            .handle(&headers(&[]), direct_put(&["one", "two", "three"]))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.request_id, REQUEST_ID);
        assert!(response.error_message.is_none());

        let entries = drain(&mut rx);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].line, "one");
        for entry in &entries {
            assert!(entry.labels.is_empty());
        }
    }

    #[tokio::test]
    async fn test_tenant_and_relabeled_internal_labels() {
        let (mut config, mut rx) = with_receiver(HandlerConfig::default());
        config.relabel_rules = vec![
            RelabelRule::copy("__aws_firehose_request_id", "aws_request_id"),
            RelabelRule::copy("__aws_firehose_source_arn", "aws_source_arn"),
        ];
        let (handler, _registry) = handler(config);

        handler
            .handle(&headers(&[(TENANT_HEADER, "20")]), direct_put(&["a", "b", "c"]))
            .await;
        let entries = drain(&mut rx);
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert_eq!(entry.labels[TENANT_LABEL], "20");
            assert_eq!(entry.labels["aws_request_id"], "header-request-id");
            assert_eq!(entry.labels["aws_source_arn"], SOURCE_ARN);
            assert!(!entry.labels.contains_key("__aws_firehose_request_id"));
        }
    }

    #[tokio::test]
    async fn test_incoming_timestamp_direct_put_truncates_to_seconds() {
        let (mut config, mut rx) = with_receiver(HandlerConfig::default());
        config.use_incoming_timestamp = true;
        let (handler, _registry) = handler(config);

        handler.handle(&headers(&[]), direct_put(&["x"])).await;
        let entries = drain(&mut rx);
        assert_eq!(entries[0].timestamp.timestamp(), REQUEST_TS / 1000);
        assert_eq!(entries[0].timestamp.timestamp_subsec_millis(), 0);
    }

    #[tokio::test]
    async fn test_cloudwatch_records_and_bad_base64() {
        let (mut config, mut rx) = with_receiver(HandlerConfig::default());
        config.use_incoming_timestamp = true;
        config.relabel_rules = vec![
            RelabelRule::copy("__aws_owner", "aws_owner"),
            RelabelRule::copy("__aws_cw_msg_type", "msg_type"),
            RelabelRule::copy("__aws_cw_log_group", "log_group"),
            RelabelRule::copy("__aws_cw_matched_filters", "filters"),
        ];
        let (handler, registry) = handler(config);

        let (status, _) = handler
            .handle(
                &headers(&[]),
                cloudwatch("DATA_MESSAGE", &[(1684424003641, "START"), (1684424003822, "END")]),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let entries = drain(&mut rx);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].line, "START");
        assert_eq!(entries[1].timestamp.timestamp_millis(), 1684424003822);
        assert_eq!(entries[0].labels["aws_owner"], "366620023056");
        assert_eq!(entries[0].labels["msg_type"], "DATA_MESSAGE");
        assert_eq!(entries[0].labels["log_group"], "/aws/lambda/logging-lambda");
        assert_eq!(entries[0].labels["filters"], "test_lambdafunction_logfilter");

        assert_eq!(
            counter(&registry, "loki_source_awsfirehose_record_errors", ("reason", "base64-decode")),
            1
        );
    }

    #[tokio::test]
    async fn test_gzip_body_and_malformed_json() {
        let (config, mut rx) = with_receiver(HandlerConfig::default());
        let (handler, _registry) = handler(config);

        let body = Bytes::from(gzip(&direct_put(&["zipped"])));
        let (status, _) = handler
            .handle(&headers(&[("content-encoding", "gzip")]), body)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(drain(&mut rx)[0].line, "zipped");

        let (status, response) = handler
            .handle(&headers(&[]), Bytes::from_static(b"{not json"))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response.error_message.is_some());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_access_key() {
        let (mut config, mut rx) = with_receiver(HandlerConfig::default());
        config.access_key = Some("fakekey".to_string());
        let (handler, _registry) = handler(config);

        let (status, _) = handler
            .handle(&headers(&[(ACCESS_KEY_HEADER, "fakekey")]), direct_put(&["ok"]))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, response) = handler
            .handle(&headers(&[(ACCESS_KEY_HEADER, "badkey")]), direct_put(&["bad"]))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.request_id, "header-request-id");

        let (status, _) = handler.handle(&headers(&[]), direct_put(&["none"])).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_static_labels() {
        let (handler, registry) = handler(HandlerConfig::default());

        let labels = handler.static_labels(
            &headers(&[(
                COMMON_ATTRIBUTES_HEADER,
                r#"{"commonAttributes": {"lbl_label1": "value1", "lbl_L@bEl1%": "v", "other": "x"}}"#,
            )]),
            "001",
        );
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["label1"], "value1");
        assert_eq!(labels["l_b_el1_percent"], "v");

        assert!(handler
            .static_labels(&headers(&[(COMMON_ATTRIBUTES_HEADER, "")]), "001")
            .is_empty());

        assert!(handler
            .static_labels(&headers(&[(COMMON_ATTRIBUTES_HEADER, "!@#$%^&*()_")]), "001")
            .is_empty());
        assert_eq!(
            counter(
                &registry,
                "loki_source_awsfirehose_invalid_static_labels_errors",
                ("reason", "invalid_json_format")
            ),
            1
        );

        assert!(handler
            .static_labels(
                &headers(&[(COMMON_ATTRIBUTES_HEADER, r#"{"commonAttributes": {"lbl_0mylable": "value"}}"#)]),
                "001",
            )
            .is_empty());
        assert_eq!(
            counter(
                &registry,
                "loki_source_awsfirehose_invalid_static_labels_errors",
                ("reason", "invalid_label_name")
            ),
            1
        );
    }
}
