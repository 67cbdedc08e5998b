//! Wire-level tests for the protocol records.
//!
//! These verify that records survive serialization the way peers see them:
//! optional fields, control records and correlation nonces.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_keeps_nonce_and_params() {
        let request = Request::new(
            "abc",
            vec![Param {
                order: 0,
                type_name: "string".to_string(),
                value: ParamValue::Value(json!("hello")),
            }],
        )
        .with_nonce(42);

        let serialized = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&serialized).unwrap();

        assert_eq!(decoded.endpoint, "abc");
        assert_eq!(decoded.nonce, 42);
        assert_eq!(decoded.params, request.params);
        assert!(decoded.blob.is_none());
    }

    #[test]
    fn test_request_with_session_reference() {
        let mut request = Request::new("upload", vec![]);
        request.session = Some(BlobSessionRef {
            key: "k1".to_string(),
            mime: "application/octet-stream".to_string(),
        });

        let decoded: Request =
            serde_json::from_value(serde_json::to_value(&request).unwrap()).unwrap();
        assert_eq!(decoded.session, request.session);
    }

    #[test]
    fn test_control_response_serialization() {
        let response = Response::control(SessionControlMessage::chunk(
            "k1",
            ChunkHeader {
                sequence: 2,
                size_in_bytes: 65536,
                chunk_type: ChunkType::Continue,
            },
        ));

        let decoded: Response =
            serde_json::from_value(serde_json::to_value(&response).unwrap()).unwrap();
        let scm = decoded.scm.expect("scm survives serialization");
        let header = scm.chunk_header().unwrap();
        assert_eq!(header.sequence, 2);
        assert_eq!(header.size_in_bytes, 65536);
        assert_eq!(decoded.nonce, CONTROL_NONCE);
    }

    #[test]
    fn test_error_response_serialization() {
        let response = Response::error(Status::NotImplemented, "nope").with_nonce(3);
        let decoded: Response =
            serde_json::from_value(serde_json::to_value(&response).unwrap()).unwrap();

        assert_eq!(decoded.status(), Some(Status::NotImplemented));
        assert_eq!(decoded.body, json!("nope"));
        assert_eq!(decoded.nonce, 3);
    }

    #[test]
    fn test_service_info_serialization_keeps_fingerprint() {
        let mut service = ServiceInfo::new("echo", "1.0")
            .with_controller(ControllerInfo::new("Echo", "1"));
        service.set_hint("127.0.0.1:1").unwrap();

        let decoded: ServiceInfo =
            serde_json::from_value(serde_json::to_value(&service).unwrap()).unwrap();
        assert_eq!(decoded.fingerprint(), service.fingerprint());
        assert_eq!(decoded.hint(), Some("127.0.0.1:1"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(RemoraError::Timeout(5).status(), Status::Timeout);
        assert_eq!(RemoraError::ClosedChannel.status(), Status::ChannelClosed);
        assert_eq!(
            RemoraError::NotSupported("write".into()).status(),
            Status::NotImplemented
        );
        assert_eq!(
            RemoraError::InvalidRequest("bad".into()).status(),
            Status::BadRequest
        );
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
