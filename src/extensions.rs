use crate::error::Error;
use crate::frame::Frame;
use std::fmt;

/// A live, negotiated protocol extension attached to one connection.
///
/// Extensions transform whole collapsed data frames: one frame in, one frame
/// out. They may flip rsv bits but must leave opcode, fin and masking alone.
pub trait Extension: Send {
    fn process_received(&mut self, frame: Frame) -> Result<Frame, Error>;
    fn process_to_send(&mut self, frame: Frame) -> Result<Frame, Error>;
    /// Called once after the reader loop has terminated.
    fn shutdown(&mut self) {}
}

/// Negotiation side of an extension: emits the client offer and builds the
/// live [`Extension`] from whatever the peer agreed to.
pub trait ExtensionBuilder: Send + Sync {
    /// Token name as it appears in `Sec-WebSocket-Extensions`.
    fn name(&self) -> &'static str;

    /// Whether frames produced by this extension may carry rsv1. The decoder
    /// rejects rsv1 on inbound frames unless a negotiated extension claims it.
    fn uses_rsv1(&self) -> bool {
        false
    }

    /// The offer this side sends when acting as a client.
    fn client_offer(&self) -> ExtensionOffer;

    /// Server side: given a client offer, decline (`Ok(None)`) or produce the
    /// response params plus the live extension.
    fn accept_offer(
        &self,
        offer: &ExtensionOffer,
    ) -> Result<Option<(ExtensionOffer, Box<dyn Extension>)>, Error>;

    /// Client side: given the params the server answered with, build the live
    /// extension.
    fn accept_response(&self, response: &ExtensionOffer) -> Result<Box<dyn Extension>, Error>;
}

/// One parsed `Sec-WebSocket-Extensions` entry: a token name plus its
/// `param` / `param=value` list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

impl ExtensionOffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.params.push((key.into(), value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Option<String>> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.params {
            match value {
                Some(value) => write!(f, "; {}={}", key, value)?,
                None => write!(f, "; {}", key)?,
            }
        }
        Ok(())
    }
}

/// Parses a `Sec-WebSocket-Extensions` header value. Multiple offers are
/// comma-separated, params semicolon-separated, values optionally quoted.
pub fn parse_offers(header_value: &str) -> Vec<ExtensionOffer> {
    let mut offers = Vec::new();

    for entry in header_value.split(',') {
        let mut parts = entry.split(';');
        let name = match parts.next() {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => continue,
        };

        let mut offer = ExtensionOffer::new(name);
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((key, value)) => {
                    let value = value.trim().trim_matches('"').to_string();
                    offer.params.push((key.trim().to_string(), Some(value)));
                }
                None => offer.params.push((param.to_string(), None)),
            }
        }
        offers.push(offer);
    }

    offers
}

/// The ordered chain of live extensions on a connection. Outbound frames run
/// through it in negotiated order, inbound frames in reverse, per RFC 7692.
pub struct ExtensionPipeline {
    extensions: Vec<Box<dyn Extension>>,
    rsv1: bool,
}

impl ExtensionPipeline {
    pub fn empty() -> Self {
        Self {
            extensions: Vec::new(),
            rsv1: false,
        }
    }

    pub fn new(extensions: Vec<Box<dyn Extension>>, rsv1: bool) -> Self {
        Self { extensions, rsv1 }
    }

    /// Whether a negotiated extension claims the rsv1 bit on data frames.
    pub fn allows_rsv1(&self) -> bool {
        self.rsv1
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn process_to_send(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        for extension in self.extensions.iter_mut() {
            frame = extension.process_to_send(frame)?;
        }
        Ok(frame)
    }

    pub fn process_received(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        for extension in self.extensions.iter_mut().rev() {
            frame = extension.process_received(frame)?;
        }
        Ok(frame)
    }

    pub fn shutdown(&mut self) {
        for extension in self.extensions.iter_mut() {
            extension.shutdown();
        }
    }
}

/// Server-side negotiation: walks the configured builders in order, matching
/// each against the client's offers. Returns the response header value (if
/// anything was agreed) and the live pipeline.
pub fn negotiate_server(
    builders: &[std::sync::Arc<dyn ExtensionBuilder>],
    offers: &[ExtensionOffer],
) -> Result<(Option<String>, ExtensionPipeline), Error> {
    let mut agreed = Vec::new();
    let mut tokens = Vec::new();
    let mut rsv1 = false;

    for builder in builders {
        let matching = offers.iter().find(|offer| offer.name == builder.name());
        if let Some(offer) = matching {
            if let Some((response, extension)) = builder.accept_offer(offer)? {
                tokens.push(response.to_string());
                agreed.push(extension);
                rsv1 |= builder.uses_rsv1();
            }
        }
    }

    let header = if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(", "))
    };
    Ok((header, ExtensionPipeline::new(agreed, rsv1)))
}

/// Client-side offer header for the configured builders.
pub fn client_offers(builders: &[std::sync::Arc<dyn ExtensionBuilder>]) -> Option<String> {
    if builders.is_empty() {
        return None;
    }
    let tokens: Vec<String> = builders
        .iter()
        .map(|builder| builder.client_offer().to_string())
        .collect();
    Some(tokens.join(", "))
}

/// Client-side negotiation: every extension the server answered with must
/// match one of our offered builders, in order.
pub fn negotiate_client(
    builders: &[std::sync::Arc<dyn ExtensionBuilder>],
    response_header: Option<&str>,
) -> Result<ExtensionPipeline, Error> {
    let responses = match response_header {
        Some(value) => parse_offers(value),
        None => return Ok(ExtensionPipeline::empty()),
    };

    let mut agreed = Vec::new();
    let mut rsv1 = false;

    for response in &responses {
        let builder = builders
            .iter()
            .find(|builder| builder.name() == response.name)
            .ok_or_else(|| Error::UnsolicitedExtension(response.name.clone()))?;
        agreed.push(builder.accept_response(response)?);
        rsv1 |= builder.uses_rsv1();
    }

    Ok(ExtensionPipeline::new(agreed, rsv1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_offer() {
        let offers = parse_offers("permessage-deflate");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].name, "permessage-deflate");
        assert!(offers[0].params.is_empty());
    }

    #[test]
    fn parse_offer_with_params() {
        let offers =
            parse_offers("permessage-deflate; client_max_window_bits=10; server_no_context_takeover");
        assert_eq!(offers.len(), 1);
        assert_eq!(
            offers[0].get("client_max_window_bits"),
            Some(&Some("10".to_string()))
        );
        assert!(offers[0].has("server_no_context_takeover"));
    }

    #[test]
    fn parse_multiple_offers() {
        let offers = parse_offers("permessage-deflate; client_max_window_bits, permessage-deflate");
        assert_eq!(offers.len(), 2);
        assert!(offers[0].has("client_max_window_bits"));
        assert!(offers[1].params.is_empty());
    }

    #[test]
    fn offer_display_roundtrip() {
        let offer = ExtensionOffer::new("permessage-deflate")
            .param("server_max_window_bits", Some("12".to_string()))
            .param("client_no_context_takeover", None);
        let formatted = offer.to_string();
        assert_eq!(
            formatted,
            "permessage-deflate; server_max_window_bits=12; client_no_context_takeover"
        );
        assert_eq!(parse_offers(&formatted), vec![offer]);
    }
}
