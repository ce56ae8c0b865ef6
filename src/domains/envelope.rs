use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RpcError, WalletBridgeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextName {
    Background,
    ContentScript,
    Inpage,
    Popup,
}

impl ContextName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::ContentScript => "contentScript",
            Self::Inpage => "inpage",
            Self::Popup => "popup",
        }
    }
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextName {
    type Err = WalletBridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "background" => Ok(Self::Background),
            "contentScript" => Ok(Self::ContentScript),
            "inpage" => Ok(Self::Inpage),
            "popup" => Ok(Self::Popup),
            other => Err(WalletBridgeError::Validation(format!(
                "unknown context `{other}`"
            ))),
        }
    }
}

/// Named duplex pipe between two contexts, written `<contextA>:<contextB>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel {
    pub a: ContextName,
    pub b: ContextName,
}

impl Channel {
    pub const BACKGROUND_CONTENT_SCRIPT: Channel =
        Channel::new(ContextName::Background, ContextName::ContentScript);
    pub const BACKGROUND_INPAGE: Channel =
        Channel::new(ContextName::Background, ContextName::Inpage);

    pub const fn new(a: ContextName, b: ContextName) -> Self {
        Self { a, b }
    }

    pub fn involves(&self, context: ContextName) -> bool {
        self.a == context || self.b == context
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.a, self.b)
    }
}

impl FromStr for Channel {
    type Err = WalletBridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (a, b) = value.split_once(':').ok_or_else(|| {
            WalletBridgeError::Validation(format!("malformed channel `{value}`"))
        })?;
        Ok(Self::new(a.parse()?, b.parse()?))
    }
}

impl TryFrom<String> for Channel {
    type Error = WalletBridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Event,
}

/// Metadata attached by tagging sites (bridges and extension-side messengers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderMeta {
    pub context: ContextName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_seq: Option<u64>,
}

impl SenderMeta {
    pub fn new(context: ContextName) -> Self {
        Self {
            context,
            tab_id: None,
            identity: None,
            relay_seq: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub channel: Channel,
    pub kind: EnvelopeKind,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<SenderMeta>,
}

impl Envelope {
    pub fn request(channel: Channel, id: u64, from: &str, method: &str, payload: Value) -> Self {
        Self {
            id: Some(id),
            channel,
            kind: EnvelopeKind::Request,
            method: method.to_string(),
            payload,
            error: None,
            from: Some(from.to_string()),
            to: None,
            meta: None,
        }
    }

    /// Builds the single response for `request`, carrying either a result or an error.
    pub fn response_to(request: &Envelope, outcome: std::result::Result<Value, RpcError>) -> Self {
        let (payload, error) = match outcome {
            Ok(value) => (value, None),
            Err(err) => (Value::Null, Some(err)),
        };
        Self {
            id: request.id,
            channel: request.channel,
            kind: EnvelopeKind::Response,
            method: request.method.clone(),
            payload,
            error,
            from: None,
            to: request.from.clone(),
            meta: None,
        }
    }

    pub fn event(channel: Channel, name: &str, payload: Value) -> Self {
        Self {
            id: None,
            channel,
            kind: EnvelopeKind::Event,
            method: name.to_string(),
            payload,
            error: None,
            from: None,
            to: None,
            meta: None,
        }
    }

    /// Structural checks beyond what deserialization enforces.
    pub fn check_shape(&self) -> std::result::Result<(), WalletBridgeError> {
        if self.method.trim().is_empty() {
            return Err(WalletBridgeError::Validation(
                "envelope method is empty".to_string(),
            ));
        }
        match self.kind {
            EnvelopeKind::Request if self.id.is_none() || self.from.is_none() => Err(
                WalletBridgeError::Validation("request envelope without id or sender".to_string()),
            ),
            EnvelopeKind::Response if self.id.is_none() => Err(WalletBridgeError::Validation(
                "response envelope without id".to_string(),
            )),
            EnvelopeKind::Event if self.id.is_some() => Err(WalletBridgeError::Validation(
                "event envelope carries an id".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.identity.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_wire_form() {
        assert_eq!(
            Channel::BACKGROUND_CONTENT_SCRIPT.to_string(),
            "background:contentScript"
        );
        let parsed: Channel = "background:inpage".parse().unwrap();
        assert_eq!(parsed, Channel::BACKGROUND_INPAGE);
        assert!("background".parse::<Channel>().is_err());
        assert!("background:nowhere".parse::<Channel>().is_err());
    }

    #[test]
    fn envelope_serializes_camel_case_and_omits_event_id() {
        let event = Envelope::event(Channel::BACKGROUND_INPAGE, "chainChanged", json!("0x5"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["channel"], "background:inpage");
        assert_eq!(value["kind"], "event");
        assert!(value.get("id").is_none());
        event.check_shape().unwrap();
    }

    #[test]
    fn response_targets_the_requester() {
        let request = Envelope::request(
            Channel::BACKGROUND_INPAGE,
            7,
            "m-1",
            "providerRequest",
            json!({}),
        );
        let response = Envelope::response_to(&request, Err(RpcError::user_rejected()));
        assert_eq!(response.id, Some(7));
        assert_eq!(response.to.as_deref(), Some("m-1"));
        assert_eq!(response.kind, EnvelopeKind::Response);
        assert_eq!(response.error.unwrap().code, 4001);
    }

    #[test]
    fn shape_check_rejects_request_without_sender() {
        let mut request =
            Envelope::request(Channel::BACKGROUND_INPAGE, 1, "m", "ping", Value::Null);
        request.from = None;
        assert!(request.check_shape().is_err());
    }
}
