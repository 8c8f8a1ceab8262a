//! The two SASL exchanges both SMTP and IMAP offer: PLAIN (RFC 4616)
//! and the de-facto LOGIN mechanism.
use data_encoding::BASE64;

/// Decode a PLAIN initial response: base64 of
/// `authzid NUL authcid NUL password`.
pub fn decode_plain(payload: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(payload.trim().as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let login = parts.next()?.to_string();
    let password = parts.next()?.to_string();
    Some((login, password))
}

/// Decode the two base64 lines of a LOGIN exchange.
pub fn decode_login(login: &str, password: &str) -> Option<(String, String)> {
    let login = String::from_utf8(BASE64.decode(login.trim().as_bytes()).ok()?).ok()?;
    let password = String::from_utf8(BASE64.decode(password.trim().as_bytes()).ok()?).ok()?;
    Some((login, password))
}

/// Base64 prompts for the LOGIN exchange: "Username:" / "Password:".
pub const LOGIN_USER_PROMPT: &str = "VXNlcm5hbWU6";
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn plain_decoding() {
        // "\0fred\0secret"
        assert_equal!(
            decode_plain("AGZyZWQAc2VjcmV0"),
            Some(("fred".to_string(), "secret".to_string()))
        );
        assert_equal!(decode_plain("!!!"), None);
        // Missing password field.
        assert_equal!(decode_plain("AGZyZWQ="), None);
    }

    #[test]
    fn login_decoding() {
        assert_equal!(
            decode_login("ZnJlZA==", "c2VjcmV0"),
            Some(("fred".to_string(), "secret".to_string()))
        );
        assert_equal!(decode_login("ZnJlZA==", "%%%"), None);
    }
}
