//! The LoST protocol error taxonomy of RFC 5222 section 13.
//!
//! Every failure on the serving path becomes one of these variants and is
//! delivered to the client as an `<errors>` document inside an HTTP 200
//! response. The client side reverses the mapping with [`LostError::from_response`].

use thiserror::Error;

use crate::xml::Element;
use crate::LOST_NAMESPACE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LostError {
    /// The server could not parse or otherwise understand the request.
    #[error("{0}")]
    BadRequest(String),

    /// The server refused to answer, e.g. a peer declined recursion.
    #[error("{0}")]
    Forbidden(String),

    /// Misconfiguration or another non-protocol failure inside the server.
    #[error("{0}")]
    InternalError(String),

    #[error("{0}")]
    LocationProfileUnrecognized(String),

    /// Latitude or longitude outside the acceptable range.
    #[error("{0}")]
    LocationInvalid(String),

    /// `srsName` does not match the accepted spatial reference system.
    #[error("{0}")]
    SrsInvalid(String),

    /// The server's own id already appears in the request `<path>`.
    #[error("{0}")]
    Loop(String),

    /// No mapping matches the query.
    #[error("{0}")]
    NotFound(String),

    /// A peer answered with something that is not a LoST document.
    #[error("{0}")]
    ServerError(String),

    /// The deadline expired while waiting for a peer or the store.
    #[error("{0}")]
    ServerTimeout(String),

    /// The location lies outside the server's authoritative shape.
    #[error("{0}")]
    NotAuthoritative(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    ServiceNotImplemented(String),

    #[error("{0}")]
    GeometryNotImplemented(String),
}

impl LostError {
    /// The wire name of the error, used as the child element's local name.
    pub fn kind(&self) -> &'static str {
        match self {
            LostError::BadRequest(_) => "badRequest",
            LostError::Forbidden(_) => "forbidden",
            LostError::InternalError(_) => "internalError",
            LostError::LocationProfileUnrecognized(_) => "locationProfileUnrecognized",
            LostError::LocationInvalid(_) => "locationInvalid",
            LostError::SrsInvalid(_) => "SRSInvalid",
            LostError::Loop(_) => "loop",
            LostError::NotFound(_) => "notFound",
            LostError::ServerError(_) => "serverError",
            LostError::ServerTimeout(_) => "serverTimeout",
            LostError::NotAuthoritative(_) => "notAuthoritative",
            LostError::NotImplemented(_) => "notImplemented",
            LostError::ServiceNotImplemented(_) => "serviceNotImplemented",
            LostError::GeometryNotImplemented(_) => "geometryNotImplemented",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            LostError::BadRequest(m)
            | LostError::Forbidden(m)
            | LostError::InternalError(m)
            | LostError::LocationProfileUnrecognized(m)
            | LostError::LocationInvalid(m)
            | LostError::SrsInvalid(m)
            | LostError::Loop(m)
            | LostError::NotFound(m)
            | LostError::ServerError(m)
            | LostError::ServerTimeout(m)
            | LostError::NotAuthoritative(m)
            | LostError::NotImplemented(m)
            | LostError::ServiceNotImplemented(m)
            | LostError::GeometryNotImplemented(m) => m,
        }
    }

    /// Rebuild the variant matching a wire name, as found in a peer's
    /// `<errors>` response. Unknown names degrade to `serverError`.
    pub fn from_kind(kind: &str, message: String) -> LostError {
        match kind {
            "badRequest" => LostError::BadRequest(message),
            "forbidden" => LostError::Forbidden(message),
            "internalError" => LostError::InternalError(message),
            "locationProfileUnrecognized" => LostError::LocationProfileUnrecognized(message),
            "locationInvalid" => LostError::LocationInvalid(message),
            "SRSInvalid" => LostError::SrsInvalid(message),
            "loop" => LostError::Loop(message),
            "notFound" => LostError::NotFound(message),
            "serverError" => LostError::ServerError(message),
            "serverTimeout" => LostError::ServerTimeout(message),
            "notAuthoritative" => LostError::NotAuthoritative(message),
            "notImplemented" => LostError::NotImplemented(message),
            "serviceNotImplemented" => LostError::ServiceNotImplemented(message),
            "geometryNotImplemented" => LostError::GeometryNotImplemented(message),
            other => LostError::ServerError(format!("Unknown error kind \"{}\": {}", other, message)),
        }
    }

    /// Serialize into the `<errors>` envelope delivered to clients.
    pub fn to_xml(&self, source: Option<&str>) -> Element {
        let mut child = Element::new(LOST_NAMESPACE, self.kind()).attr("message", self.message());
        if let Some(source) = source {
            child = child.attr("source", source);
        }
        Element::new(LOST_NAMESPACE, "errors").child(child.attr("xml:lang", "en"))
    }

    /// Inspect a response document and lift an `<errors>` body back into the
    /// corresponding variant. Returns `None` for non-error documents.
    pub fn from_response(doc: &Element) -> Option<LostError> {
        if !doc.is(LOST_NAMESPACE, "errors") {
            return None;
        }
        match doc.children.first() {
            Some(child) => Some(LostError::from_kind(
                &child.name,
                child.get_attr("message").unwrap_or_default().to_string(),
            )),
            None => Some(LostError::ServerError(
                "Empty errors response".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml;

    #[test]
    fn serializes_the_error_envelope() {
        let err = LostError::NotFound("No mapping matches the location".to_string());
        let doc = err.to_xml(Some("lost-server"));
        assert!(doc.is(LOST_NAMESPACE, "errors"));

        let child = &doc.children[0];
        assert_eq!(child.name, "notFound");
        assert_eq!(child.get_attr("message"), Some("No mapping matches the location"));
        assert_eq!(child.get_attr("source"), Some("lost-server"));
        assert_eq!(child.get_attr("xml:lang"), Some("en"));
    }

    #[test]
    fn keeps_the_srs_capitalization() {
        let err = LostError::SrsInvalid("EPSG::3857".to_string());
        assert_eq!(err.kind(), "SRSInvalid");
        assert_eq!(
            LostError::from_kind("SRSInvalid", "EPSG::3857".to_string()),
            err
        );
    }

    #[test]
    fn round_trips_every_kind_through_the_wire_form() {
        let errors = [
            LostError::BadRequest("m".into()),
            LostError::Forbidden("m".into()),
            LostError::InternalError("m".into()),
            LostError::LocationProfileUnrecognized("m".into()),
            LostError::LocationInvalid("m".into()),
            LostError::SrsInvalid("m".into()),
            LostError::Loop("m".into()),
            LostError::NotFound("m".into()),
            LostError::ServerError("m".into()),
            LostError::ServerTimeout("m".into()),
            LostError::NotAuthoritative("m".into()),
            LostError::NotImplemented("m".into()),
            LostError::ServiceNotImplemented("m".into()),
            LostError::GeometryNotImplemented("m".into()),
        ];
        for err in errors {
            let doc = xml::parse(&err.to_xml(Some("s")).to_xml()).unwrap();
            assert_eq!(LostError::from_response(&doc), Some(err));
        }
    }

    #[test]
    fn ignores_non_error_documents() {
        let doc = Element::new(LOST_NAMESPACE, "findServiceResponse");
        assert_eq!(LostError::from_response(&doc), None);
    }

    #[test]
    fn unknown_kinds_degrade_to_server_error() {
        let err = LostError::from_kind("meltdown", "oh no".to_string());
        assert!(matches!(err, LostError::ServerError(_)));
    }
}
