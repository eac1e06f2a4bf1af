//! Kafka wire protocol: ApiVersions v0 and Metadata v0
//!
//! Requests and responses are framed by a 4-byte big-endian size. Both
//! versions predate flexible (tagged-field) encoding, so every string is an
//! INT16 length followed by bytes and every array an INT32 count.

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::sync::OnceLock;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, LengthPrefixed};
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 9092;

const API_METADATA: i16 = 3;
const API_VERSIONS: i16 = 18;

#[derive(Debug, Clone)]
pub struct KafkaRequest {
    pub target: ProbeTarget,
    pub client_id: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersion {
    pub api_key: i16,
    pub name: &'static str,
    pub min_version: i16,
    pub max_version: i16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Broker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub name: String,
    pub error_code: i16,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub brokers: Vec<Broker>,
    pub topics: Vec<Topic>,
}

pub fn api_name(key: i16) -> &'static str {
    match key {
        0 => "Produce",
        1 => "Fetch",
        2 => "ListOffsets",
        3 => "Metadata",
        4 => "LeaderAndIsr",
        5 => "StopReplica",
        6 => "UpdateMetadata",
        7 => "ControlledShutdown",
        8 => "OffsetCommit",
        9 => "OffsetFetch",
        10 => "FindCoordinator",
        11 => "JoinGroup",
        12 => "Heartbeat",
        13 => "LeaveGroup",
        14 => "SyncGroup",
        15 => "DescribeGroups",
        16 => "ListGroups",
        17 => "SaslHandshake",
        18 => "ApiVersions",
        19 => "CreateTopics",
        20 => "DeleteTopics",
        21 => "DeleteRecords",
        22 => "InitProducerId",
        23 => "OffsetForLeaderEpoch",
        24 => "AddPartitionsToTxn",
        25 => "AddOffsetsToTxn",
        26 => "EndTxn",
        27 => "WriteTxnMarkers",
        28 => "TxnOffsetCommit",
        29 => "DescribeAcls",
        30 => "CreateAcls",
        31 => "DeleteAcls",
        32 => "DescribeConfigs",
        33 => "AlterConfigs",
        34 => "AlterReplicaLogDirs",
        35 => "DescribeLogDirs",
        36 => "SaslAuthenticate",
        37 => "CreatePartitions",
        38 => "CreateDelegationToken",
        39 => "RenewDelegationToken",
        40 => "ExpireDelegationToken",
        41 => "DescribeDelegationToken",
        42 => "DeleteGroups",
        43 => "ElectLeaders",
        44 => "IncrementalAlterConfigs",
        45 => "AlterPartitionReassignments",
        46 => "ListPartitionReassignments",
        47 => "OffsetDelete",
        48 => "DescribeClientQuotas",
        49 => "AlterClientQuotas",
        50 => "DescribeUserScramCredentials",
        51 => "AlterUserScramCredentials",
        55 => "DescribeQuorum",
        57 => "UpdateFeatures",
        60 => "DescribeCluster",
        61 => "DescribeProducers",
        64 => "UnregisterBroker",
        65 => "DescribeTransactions",
        66 => "ListTransactions",
        67 => "AllocateProducerIds",
        68 => "ConsumerGroupHeartbeat",
        _ => "Unknown",
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as i16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn encode_request(api_key: i16, correlation_id: i32, client_id: &str, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32 + body.len());
    msg.extend_from_slice(&api_key.to_be_bytes());
    msg.extend_from_slice(&0i16.to_be_bytes());
    msg.extend_from_slice(&correlation_id.to_be_bytes());
    put_string(&mut msg, client_id);
    msg.extend_from_slice(body);

    let mut out = (msg.len() as i32).to_be_bytes().to_vec();
    out.extend_from_slice(&msg);
    out
}

pub fn encode_api_versions(correlation_id: i32, client_id: &str) -> Vec<u8> {
    encode_request(API_VERSIONS, correlation_id, client_id, &[])
}

/// An empty topic list asks for every topic
pub fn encode_metadata(correlation_id: i32, client_id: &str, topics: &[String]) -> Vec<u8> {
    let mut body = (topics.len() as i32).to_be_bytes().to_vec();
    for topic in topics {
        put_string(&mut body, topic);
    }
    encode_request(API_METADATA, correlation_id, client_id, &body)
}

pub fn response_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(4, |header: &[u8]| {
        let size = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if size < 4 {
            return Err(format!("invalid response size {}", size));
        }
        Ok(4 + size as usize)
    })
}

/// Skip the size prefix and check the correlation id
fn response_body(frame: &[u8], correlation_id: i32) -> Result<ByteReader<'_>> {
    let mut r = ByteReader::new("Kafka", frame);
    r.skip(4, "size")?;
    let got = r.i32_be("correlation id")?;
    if got != correlation_id {
        return Err(r.error(format!(
            "correlation id mismatch: sent {}, received {}",
            correlation_id, got
        )));
    }
    Ok(r)
}

fn array_len(r: &mut ByteReader<'_>, field: &str) -> Result<usize> {
    let n = r.i32_be(field)?;
    if n < 0 {
        return Ok(0);
    }
    let n = n as usize;
    // Every element takes at least two bytes
    if n > r.remaining() / 2 + 1 {
        return Err(r.error(format!("{} count {} exceeds the response size", field, n)));
    }
    Ok(n)
}

fn string(r: &mut ByteReader<'_>, field: &str) -> Result<String> {
    let len = r.i16_be(field)?;
    if len < 0 {
        return Ok(String::new());
    }
    r.text(len as usize, field)
}

pub fn decode_api_versions(frame: &[u8], correlation_id: i32) -> Result<(i16, Vec<ApiVersion>)> {
    let mut r = response_body(frame, correlation_id)?;
    let error_code = r.i16_be("error code")?;
    let count = array_len(&mut r, "api keys")?;
    let mut versions = Vec::with_capacity(count);
    for _ in 0..count {
        let api_key = r.i16_be("api key")?;
        versions.push(ApiVersion {
            api_key,
            name: api_name(api_key),
            min_version: r.i16_be("min version")?,
            max_version: r.i16_be("max version")?,
        });
    }
    Ok((error_code, versions))
}

fn i32_array(r: &mut ByteReader<'_>, field: &str) -> Result<Vec<i32>> {
    let n = array_len(r, field)?;
    (0..n).map(|_| r.i32_be(field)).collect()
}

pub fn decode_metadata(frame: &[u8], correlation_id: i32) -> Result<Metadata> {
    let mut r = response_body(frame, correlation_id)?;

    let broker_count = array_len(&mut r, "brokers")?;
    let mut brokers = Vec::with_capacity(broker_count);
    for _ in 0..broker_count {
        brokers.push(Broker {
            node_id: r.i32_be("node id")?,
            host: string(&mut r, "broker host")?,
            port: r.i32_be("broker port")?,
        });
    }

    let topic_count = array_len(&mut r, "topics")?;
    let mut topics = Vec::with_capacity(topic_count);
    for _ in 0..topic_count {
        let error_code = r.i16_be("topic error code")?;
        let name = string(&mut r, "topic name")?;
        let partition_count = array_len(&mut r, "partitions")?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let error_code = r.i16_be("partition error code")?;
            partitions.push(Partition {
                partition: r.i32_be("partition id")?,
                leader: r.i32_be("leader")?,
                replicas: i32_array(&mut r, "replicas")?,
                isr: i32_array(&mut r, "isr")?,
                error_code,
            });
        }
        topics.push(Topic {
            name,
            error_code,
            partitions,
        });
    }

    Ok(Metadata { brokers, topics })
}

fn validate_request(raw: &RawRequest, limits: &ProbeLimits) -> Result<KafkaRequest> {
    static CLIENT_ID: OnceLock<regex::Regex> = OnceLock::new();
    static TOPIC: OnceLock<regex::Regex> = OnceLock::new();

    let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
    let client_id = raw
        .str_field("clientId")?
        .unwrap_or_else(|| String::from("wireprobe"));
    validate_pattern(
        &client_id,
        pattern(&CLIENT_ID, r"^[A-Za-z0-9._-]{1,64}$"),
        "Invalid clientId format",
    )?;
    let topics = raw.string_list("topics")?;
    for topic in &topics {
        validate_pattern(
            topic,
            pattern(&TOPIC, r"^[A-Za-z0-9._-]{1,249}$"),
            "Invalid topic name",
        )?;
    }
    Ok(KafkaRequest {
        target,
        client_id,
        topics,
    })
}

fn correlation_id() -> i32 {
    rand::thread_rng().gen_range(1..i32::MAX)
}

pub struct KafkaVersions;

#[async_trait]
impl Probe for KafkaVersions {
    type Request = KafkaRequest;

    fn name(&self) -> &'static str {
        "Kafka"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<KafkaRequest> {
        validate_request(raw, limits)
    }

    fn target<'a>(&self, request: &'a KafkaRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &KafkaRequest, conn: &mut Connection) -> Result<Payload> {
        let id = correlation_id();
        let frame = conn
            .exchange(&encode_api_versions(id, &request.client_id), &response_decoder())
            .await?;
        let (error_code, api_versions) = decode_api_versions(&frame, id)?;
        if api_versions.is_empty() && error_code != 0 {
            return Err(Error::rejected(
                "Kafka",
                format!("ApiVersions failed with error code {}", error_code),
            ));
        }

        Ok(Payload::new()
            .with("kafkaErrorCode", error_code)
            .with("apiCount", api_versions.len())
            .with("apiVersions", serde_json::to_value(&api_versions)?))
    }
}

pub struct KafkaMetadata;

#[async_trait]
impl Probe for KafkaMetadata {
    type Request = KafkaRequest;

    fn name(&self) -> &'static str {
        "Kafka"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<KafkaRequest> {
        validate_request(raw, limits)
    }

    fn target<'a>(&self, request: &'a KafkaRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &KafkaRequest, conn: &mut Connection) -> Result<Payload> {
        let id = correlation_id();
        let request_bytes = encode_metadata(id, &request.client_id, &request.topics);
        let frame = conn.exchange(&request_bytes, &response_decoder()).await?;
        let metadata = decode_metadata(&frame, id)?;

        Ok(Payload::from_serialize(&metadata)?
            .with("brokerCount", metadata.brokers.len())
            .with("topicCount", metadata.topics.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as i32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn api_versions_response(correlation_id: i32) -> Vec<u8> {
        let mut body = correlation_id.to_be_bytes().to_vec();
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&2i32.to_be_bytes());
        for (key, min, max) in [(0i16, 0i16, 9i16), (18, 0, 3)] {
            body.extend_from_slice(&key.to_be_bytes());
            body.extend_from_slice(&min.to_be_bytes());
            body.extend_from_slice(&max.to_be_bytes());
        }
        frame(&body)
    }

    #[test]
    fn test_encode_api_versions() {
        let bytes = encode_api_versions(7, "wireprobe");
        assert_eq!(&bytes[..4], &((bytes.len() - 4) as i32).to_be_bytes());
        assert_eq!(&bytes[4..6], &18i16.to_be_bytes());
        assert_eq!(&bytes[6..8], &0i16.to_be_bytes());
        assert_eq!(&bytes[8..12], &7i32.to_be_bytes());
        assert_eq!(&bytes[12..14], &9i16.to_be_bytes());
        assert_eq!(&bytes[14..], b"wireprobe");
    }

    #[test]
    fn test_decode_api_versions() {
        let (error_code, versions) = decode_api_versions(&api_versions_response(42), 42).unwrap();
        assert_eq!(error_code, 0);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].name, "Produce");
        assert_eq!(versions[1].max_version, 3);
        assert!(decode_api_versions(&api_versions_response(42), 43).is_err());
    }

    #[test]
    fn test_decode_metadata() {
        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&9i16.to_be_bytes());
        body.extend_from_slice(b"broker-01");
        body.extend_from_slice(&9092i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&6i16.to_be_bytes());
        body.extend_from_slice(b"orders");
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());

        let metadata = decode_metadata(&frame(&body), 5).unwrap();
        assert_eq!(metadata.brokers[0].host, "broker-01");
        assert_eq!(metadata.brokers[0].port, 9092);
        assert_eq!(metadata.topics[0].name, "orders");
        assert_eq!(metadata.topics[0].partitions[0].leader, 1);
        assert_eq!(metadata.topics[0].partitions[0].isr, vec![1]);
    }

    #[test]
    fn test_oversized_array_count_rejected() {
        let mut body = 1i32.to_be_bytes().to_vec();
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&1_000_000i32.to_be_bytes());
        assert!(decode_api_versions(&frame(&body), 1).is_err());
    }

    #[test]
    fn test_topic_validation() {
        let raw = RawRequest::new()
            .with("host", "broker")
            .with("topics", serde_json::json!(["ok.topic", "bad topic"]));
        assert!(KafkaMetadata.validate(&raw, &ProbeLimits::default()).is_err());
    }

    #[tokio::test]
    async fn test_versions_against_fake_broker() {
        let port = serve_once(|mut socket| async move {
            let mut size = [0u8; 4];
            socket.read_exact(&mut size).await.unwrap();
            let mut request = vec![0u8; i32::from_be_bytes(size) as usize];
            socket.read_exact(&mut request).await.unwrap();
            let id = i32::from_be_bytes([request[4], request[5], request[6], request[7]]);
            socket.write_all(&api_versions_response(id)).await.unwrap();
        })
        .await;

        let envelope = run(&KafkaVersions, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["apiCount"], 2);
        assert_eq!(json["apiVersions"][1]["name"], "ApiVersions");
    }
}
