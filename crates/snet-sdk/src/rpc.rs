//! Unary gRPC invocation against a service daemon.
//!
//! Requests are either hand-declared prost messages ([`RpcClient::call_typed`])
//! or [`DynamicMessage`]s built from the compiled schema
//! ([`RpcClient::call_dynamic`]). The JSON helpers convert between the two
//! representations using proto field names and emitting unpopulated fields.

use std::time::Duration;

use bytes::Buf;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, ReflectMessage, SerializeOptions};
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder, ProstCodec};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Status;

use crate::config::Timeouts;
use crate::schema::MethodInfo;
use crate::strategy::PaymentHeaders;
use crate::{Result, SdkError};

/// Transport credentials chosen for a daemon endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    /// TLS with the system's root certificates.
    Tls,
    Plaintext,
}

/// `https://` selects TLS; `http://` and bare `host[:port]` are plaintext.
/// Returns the credentials and the URI to dial.
pub fn transport_security(endpoint: &str) -> (TransportSecurity, String) {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("https://") {
        (TransportSecurity::Tls, endpoint.to_string())
    } else if lower.starts_with("http://") {
        (TransportSecurity::Plaintext, endpoint.to_string())
    } else {
        (TransportSecurity::Plaintext, format!("http://{endpoint}"))
    }
}

/// Parse JSON into a message of type `desc`. Unknown fields are discarded
/// and absent fields keep their defaults.
pub fn json_to_message(desc: MessageDescriptor, json: &[u8]) -> Result<DynamicMessage> {
    let mut de = serde_json::Deserializer::from_slice(json);
    let options = DeserializeOptions::new().deny_unknown_fields(false);
    let msg = DynamicMessage::deserialize_with_options(desc, &mut de, &options)
        .map_err(|e| SdkError::Marshal(format!("invalid request JSON: {e}")))?;
    de.end()
        .map_err(|e| SdkError::Marshal(format!("trailing data after request JSON: {e}")))?;
    Ok(msg)
}

/// Render a message as JSON with proto field names, including default values.
pub fn message_to_json(msg: &DynamicMessage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::new(&mut out);
    let options = SerializeOptions::new()
        .skip_default_fields(false)
        .use_proto_field_name(true);
    msg.serialize_with_options(&mut ser, &options)
        .map_err(|e| SdkError::Marshal(format!("encoding reply as JSON failed: {e}")))?;
    Ok(out)
}

/// Codec over [`DynamicMessage`]; replies decode against `output`.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    output: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(output: MessageDescriptor) -> Self {
        Self { output }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.output.clone())
    }
}

#[derive(Debug)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Self::Error> {
        prost::Message::encode(&item, dst)
            .map_err(|e| Status::internal(format!("encoding request failed: {e}")))?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.0.clone(), src.copy_to_bytes(src.remaining()))
            .map_err(|e| Status::internal(format!("decoding reply failed: {e}")))?;
        Ok(Some(msg))
    }
}

/// A connected daemon endpoint.
#[derive(Clone)]
pub struct RpcClient {
    channel: Channel,
    endpoint: String,
    timeouts: Timeouts,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl RpcClient {
    /// Dial `endpoint`, bounded by the dial timeout.
    pub async fn connect(endpoint: &str, timeouts: &Timeouts) -> Result<Self> {
        let (ep, security, uri) = configure(endpoint, timeouts)?;
        let channel = tokio::time::timeout(timeouts.dial, ep.connect())
            .await
            .map_err(|_| SdkError::Transport(format!("dialing {uri} timed out after {:?}", timeouts.dial)))?
            .map_err(|e| SdkError::Transport(format!("dialing {uri} failed: {e}")))?;

        tracing::debug!(endpoint = %uri, ?security, "daemon connected");
        Ok(Self {
            channel,
            endpoint: uri,
            timeouts: *timeouts,
        })
    }

    /// A client that dials on first use.
    pub fn connect_lazy(endpoint: &str, timeouts: &Timeouts) -> Result<Self> {
        let (ep, _, uri) = configure(endpoint, timeouts)?;
        Ok(Self {
            channel: ep.connect_lazy(),
            endpoint: uri,
            timeouts: *timeouts,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The underlying transport, for callers with their own generated stubs.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Issue one unary call with `codec`, attaching `headers` as metadata.
    pub async fn unary<C>(
        &self,
        path: &str,
        message: C::Encode,
        headers: Option<&PaymentHeaders>,
        codec: C,
    ) -> Result<C::Decode>
    where
        C: Codec + Send + 'static,
        C::Encode: Sync,
        C::Decode: Sync,
    {
        let path = PathAndQuery::try_from(path)
            .map_err(|e| SdkError::MethodNotFound(format!("invalid method path {path}: {e}")))?;
        let timeout = self.timeouts.rpc_unary;

        let mut request = tonic::Request::new(message);
        request.set_timeout(timeout);
        if let Some(headers) = headers {
            headers.apply(request.metadata_mut())?;
        }

        let mut grpc = Grpc::new(self.channel.clone());
        let call = async {
            grpc.ready()
                .await
                .map_err(|e| SdkError::Transport(format!("daemon not ready: {e}")))?;
            grpc.unary(request, path, codec)
                .await
                .map_err(SdkError::from_status)
        };

        let response = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| timed_out(timeout))??;
        Ok(response.into_inner())
    }

    /// Call a method with hand-declared prost messages.
    pub async fn call_typed<Req, Resp>(
        &self,
        path: &str,
        request: Req,
        headers: Option<&PaymentHeaders>,
    ) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.unary(path, request, headers, ProstCodec::<Req, Resp>::default())
            .await
    }

    /// Call a schema-resolved method with a dynamic message.
    pub async fn call_dynamic(
        &self,
        method: &MethodInfo,
        request: DynamicMessage,
        headers: Option<&PaymentHeaders>,
    ) -> Result<DynamicMessage> {
        if request.descriptor() != method.input {
            return Err(SdkError::Marshal(format!(
                "request is {}, {} expects {}",
                request.descriptor().full_name(),
                method.method,
                method.input.full_name()
            )));
        }
        let codec = DynamicCodec::new(method.output.clone());
        self.unary(&method.path(), request, headers, codec).await
    }

    /// JSON in, JSON out.
    pub async fn call_json(
        &self,
        method: &MethodInfo,
        json: &[u8],
        headers: Option<&PaymentHeaders>,
    ) -> Result<Vec<u8>> {
        let request = json_to_message(method.input.clone(), json)?;
        let reply = self.call_dynamic(method, request, headers).await?;
        message_to_json(&reply)
    }
}

fn configure(endpoint: &str, timeouts: &Timeouts) -> Result<(Endpoint, TransportSecurity, String)> {
    let (security, uri) = transport_security(endpoint);
    let mut ep = Endpoint::from_shared(uri.clone())
        .map_err(|e| SdkError::Config(format!("invalid daemon endpoint {uri}: {e}")))?
        .connect_timeout(timeouts.dial);
    if security == TransportSecurity::Tls {
        ep = ep
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| SdkError::Transport(format!("TLS setup for {uri} failed: {e}")))?;
    }
    Ok((ep, security, uri))
}

fn timed_out(timeout: Duration) -> SdkError {
    SdkError::Transport(format!("call timed out after {timeout:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use std::collections::BTreeMap;

    fn greeter() -> MethodInfo {
        let mut files = BTreeMap::new();
        files.insert(
            "demo.proto".to_string(),
            "syntax=\"proto3\"; package demo; service Greeter { rpc SayHello(HelloRequest) returns (HelloReply); } message HelloRequest{string name=1; int32 times=2;} message HelloReply{string message=1; int32 reply_count=2;}".to_string(),
        );
        Schema::compile(&files).unwrap().find_method("SayHello").unwrap()
    }

    #[test]
    fn test_transport_security_by_scheme() {
        assert_eq!(
            transport_security("https://host:443"),
            (TransportSecurity::Tls, "https://host:443".to_string())
        );
        assert_eq!(
            transport_security("http://host"),
            (TransportSecurity::Plaintext, "http://host".to_string())
        );
        assert_eq!(
            transport_security("host"),
            (TransportSecurity::Plaintext, "http://host".to_string())
        );
        assert_eq!(transport_security("HTTPS://Host:7000/").0, TransportSecurity::Tls);
    }

    #[test]
    fn test_json_discards_unknown_fields() {
        let m = greeter();
        let msg = json_to_message(m.input.clone(), br#"{"name":"ann","extra":true}"#).unwrap();
        assert_eq!(msg.get_field_by_name("name").unwrap().as_str(), Some("ann"));
    }

    #[test]
    fn test_json_reply_emits_defaults_with_proto_names() {
        let m = greeter();
        let reply = DynamicMessage::new(m.output.clone());
        let json: serde_json::Value = serde_json::from_slice(&message_to_json(&reply).unwrap()).unwrap();
        assert_eq!(json["message"], "");
        assert_eq!(json["reply_count"], 0);
    }

    #[test]
    fn test_invalid_json_is_marshal_error() {
        let m = greeter();
        assert!(matches!(
            json_to_message(m.input.clone(), b"{not json"),
            Err(SdkError::Marshal(_))
        ));
    }

    #[test]
    fn test_dynamic_codec_roundtrips_through_wire_bytes() {
        let m = greeter();
        let msg = json_to_message(m.input.clone(), br#"{"name":"bob","times":3}"#).unwrap();
        let wire = prost::Message::encode_to_vec(&msg);
        let decoded = DynamicMessage::decode(m.input.clone(), wire.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }
}
