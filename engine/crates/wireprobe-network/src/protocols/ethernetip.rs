//! EtherNet/IP encapsulation: ListIdentity (CIP Vol. 2, 2-4.2)
//!
//! Encapsulation headers are little-endian; the socket address inside the
//! identity item is big-endian, as in `sockaddr_in`.

use async_trait::async_trait;
use rand::RngCore;
use std::net::Ipv4Addr;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, LengthPrefixed};
use crate::protocols::plain_target;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 44818;

const HEADER_LEN: usize = 24;
const LIST_IDENTITY: u16 = 0x0063;
const IDENTITY_ITEM: u16 = 0x000C;

/// CIP identity object as reported by ListIdentity
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub encapsulation_version: u16,
    pub socket_address: String,
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision: (u8, u8),
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
    pub state: Option<u8>,
}

pub fn vendor_name(id: u16) -> &'static str {
    match id {
        1 => "Rockwell Automation/Allen-Bradley",
        5 => "Rockwell Automation/Reliance Electric",
        47 => "Omron Corporation",
        _ => "Unknown",
    }
}

pub fn device_type_name(id: u16) -> &'static str {
    match id {
        0x00 => "Generic Device",
        0x02 => "AC Drive",
        0x03 => "Motor Overload",
        0x04 => "Limit Switch",
        0x05 => "Inductive Proximity Switch",
        0x06 => "Photoelectric Sensor",
        0x07 => "General Purpose Discrete I/O",
        0x09 => "Resolver",
        0x0C => "Communications Adapter",
        0x0E => "Programmable Logic Controller",
        0x10 => "Position Controller",
        0x13 => "DC Drive",
        0x15 => "Contactor",
        0x16 => "Motor Starter",
        0x18 => "Human-Machine Interface",
        0x1A => "Mass Flow Controller",
        0x1B => "Pneumatic Valve",
        0x1C => "Vacuum Pressure Gauge",
        0x2B => "Generic Device (keyable)",
        0x32 => "Managed Switch",
        _ => "Unknown",
    }
}

pub fn encode_list_identity(context: [u8; 8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&LIST_IDENTITY.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&context);
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

pub fn encapsulation_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(HEADER_LEN, |header: &[u8]| {
        Ok(HEADER_LEN + u16::from_le_bytes([header[2], header[3]]) as usize)
    })
}

pub fn decode_list_identity(frame: &[u8], context: [u8; 8]) -> Result<Identity> {
    let mut r = ByteReader::new("EtherNet/IP", frame);
    let command = r.u16_le("command")?;
    if command != LIST_IDENTITY {
        return Err(r.error(format!("expected ListIdentity reply, got command {:#06x}", command)));
    }
    r.skip(2, "length")?;
    r.skip(4, "session handle")?;
    let status = r.u32_le("encapsulation status")?;
    if status != 0 {
        return Err(Error::rejected(
            "EtherNet/IP",
            format!("encapsulation status {:#010x}", status),
        ));
    }
    if r.array::<8>("sender context")? != context {
        return Err(r.error("sender context does not match the request"));
    }
    r.skip(4, "options")?;

    let items = r.u16_le("item count")?;
    for _ in 0..items {
        let item_type = r.u16_le("item type")?;
        let item_len = r.u16_le("item length")? as usize;
        let item = r.bytes(item_len, "item data")?;
        if item_type == IDENTITY_ITEM {
            return decode_identity_item(item);
        }
    }
    Err(r.error("reply carries no identity item"))
}

fn decode_identity_item(item: &[u8]) -> Result<Identity> {
    let mut r = ByteReader::new("EtherNet/IP", item);
    let encapsulation_version = r.u16_le("protocol version")?;
    r.skip(2, "sin_family")?;
    let port = r.u16_be("sin_port")?;
    let addr = Ipv4Addr::from(r.array::<4>("sin_addr")?);
    r.skip(8, "sin_zero")?;
    let vendor_id = r.u16_le("vendor id")?;
    let device_type = r.u16_le("device type")?;
    let product_code = r.u16_le("product code")?;
    let revision = (r.u8("major revision")?, r.u8("minor revision")?);
    let status = r.u16_le("status")?;
    let serial_number = r.u32_le("serial number")?;
    let name_len = r.u8("product name length")? as usize;
    let product_name = r.text(name_len, "product name")?;
    let state = if r.is_empty() { None } else { Some(r.u8("state")?) };

    Ok(Identity {
        encapsulation_version,
        socket_address: format!("{}:{}", addr, port),
        vendor_id,
        device_type,
        product_code,
        revision,
        status,
        serial_number,
        product_name,
        state,
    })
}

pub struct EnipIdentity;

#[async_trait]
impl Probe for EnipIdentity {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "EtherNet/IP"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let mut context = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut context);
        let frame = conn
            .exchange(&encode_list_identity(context), &encapsulation_decoder())
            .await?;
        let identity = decode_list_identity(&frame, context)?;

        let mut payload = Payload::new()
            .with("vendorId", identity.vendor_id)
            .with("vendorName", vendor_name(identity.vendor_id))
            .with("deviceType", identity.device_type)
            .with("deviceTypeName", device_type_name(identity.device_type))
            .with("productCode", identity.product_code)
            .with("revision", format!("{}.{:03}", identity.revision.0, identity.revision.1))
            .with("status", format!("{:#06x}", identity.status))
            .with("serialNumber", format!("{:#010x}", identity.serial_number))
            .with("productName", identity.product_name)
            .with("encapsulationVersion", identity.encapsulation_version)
            .with("socketAddress", identity.socket_address);
        if let Some(state) = identity.state {
            payload.insert("state", state);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn identity_reply(context: &[u8]) -> Vec<u8> {
        let mut item = 1u16.to_le_bytes().to_vec();
        item.extend_from_slice(&2i16.to_be_bytes());
        item.extend_from_slice(&44818u16.to_be_bytes());
        item.extend_from_slice(&[192, 168, 1, 10]);
        item.extend_from_slice(&[0u8; 8]);
        item.extend_from_slice(&1u16.to_le_bytes());
        item.extend_from_slice(&0x0Eu16.to_le_bytes());
        item.extend_from_slice(&55u16.to_le_bytes());
        item.extend_from_slice(&[20, 11]);
        item.extend_from_slice(&0x0060u16.to_le_bytes());
        item.extend_from_slice(&0xC0FFEEu32.to_le_bytes());
        let name = b"1756-L71/B LOGIX5571";
        item.push(name.len() as u8);
        item.extend_from_slice(name);
        item.push(3);

        let mut data = 1u16.to_le_bytes().to_vec();
        data.extend_from_slice(&IDENTITY_ITEM.to_le_bytes());
        data.extend_from_slice(&(item.len() as u16).to_le_bytes());
        data.extend_from_slice(&item);

        let mut out = LIST_IDENTITY.to_le_bytes().to_vec();
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(context);
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn test_decode_identity() {
        let context = *b"ctx12345";
        let identity = decode_list_identity(&identity_reply(&context), context).unwrap();
        assert_eq!(identity.vendor_id, 1);
        assert_eq!(identity.device_type, 0x0E);
        assert_eq!(identity.product_name, "1756-L71/B LOGIX5571");
        assert_eq!(identity.socket_address, "192.168.1.10:44818");
        assert_eq!(identity.state, Some(3));
        assert!(decode_list_identity(&identity_reply(&context), *b"other!!!").is_err());
    }

    #[tokio::test]
    async fn test_identity_against_fake_device() {
        let port = serve_once(|mut socket| async move {
            let mut request = [0u8; 24];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(&identity_reply(&request[12..20])).await.unwrap();
        })
        .await;

        let envelope = run(&EnipIdentity, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["vendorName"], "Rockwell Automation/Allen-Bradley");
        assert_eq!(json["deviceTypeName"], "Programmable Logic Controller");
        assert_eq!(json["revision"], "20.011");
    }
}
