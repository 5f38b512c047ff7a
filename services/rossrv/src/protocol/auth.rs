//! Login handshake primitives
//!
//! The handshake is: send a bare `/login`, read the reply, extract the
//! opaque `=ret=` challenge, answer with
//! `response = "00" + hex(md5(0x00 || password || md5(challenge)))`.
//! Devices running newer firmware accept credentials directly in the first
//! `/login` sentence and reply without a challenge; both flows are
//! supported. The session layer drives the exchange; this module only
//! builds and interprets the sentences.

use super::sentence::{ReplyKind, Sentence};
use crate::error::{RosSrvError, Result};

/// First sentence of the challenge flow: a bare `/login`
pub fn build_login_probe() -> Sentence {
    let mut s = Sentence::new();
    s.push("/login");
    s
}

/// Plaintext login sentence (post-challenge firmware)
pub fn build_plain_login(username: &str, password: &str) -> Sentence {
    let mut s = Sentence::new();
    s.push("/login");
    s.push_attribute("name", username);
    s.push_attribute("password", password);
    s
}

/// Second sentence of the challenge flow, carrying the computed response
pub fn build_login_response(username: &str, response: &str) -> Sentence {
    let mut s = Sentence::new();
    s.push("/login");
    s.push_attribute("name", username);
    s.push_attribute("response", response);
    s
}

/// Extract the challenge value from the probe reply.
///
/// A `!trap` reply or a reply without `=ret=` means the device refused the
/// challenge flow; callers decide whether to fall back to plaintext login.
pub fn extract_challenge(reply: &Sentence) -> Result<String> {
    if reply.reply_kind() == Some(ReplyKind::Trap) {
        return Err(RosSrvError::AuthenticationError(format!(
            "Login probe rejected: {}",
            reply.message().unwrap_or("no message")
        )));
    }
    reply
        .attribute("ret")
        .map(str::to_string)
        .ok_or_else(|| RosSrvError::auth("Login reply carried no challenge"))
}

/// Compute the challenge response digest.
///
/// `"00" + hex(md5(0x00 || password || md5(challenge)))`, where the
/// challenge is the opaque `=ret=` value as received.
pub fn challenge_response(password: &str, challenge: &str) -> String {
    let challenge_digest = md5::compute(challenge.as_bytes());

    let mut input = Vec::with_capacity(1 + password.len() + 16);
    input.push(0x00);
    input.extend_from_slice(password.as_bytes());
    input.extend_from_slice(challenge_digest.as_ref());

    format!("00{}", hex::encode(md5::compute(&input).as_ref() as &[u8]))
}

/// Interpret the final login reply: any non-trap reply is success
pub fn check_login_reply(reply: &Sentence) -> Result<()> {
    match reply.reply_kind() {
        Some(ReplyKind::Trap) | Some(ReplyKind::Fatal) => {
            Err(RosSrvError::AuthenticationError(format!(
                "Login rejected: {}",
                reply.message().unwrap_or("no message")
            )))
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shape() {
        let response = challenge_response("secret", "a1b2c3d4e5f60718293a4b5c6d7e8f90");
        assert!(response.starts_with("00"));
        // "00" prefix plus 32 hex digits of md5
        assert_eq!(response.len(), 34);
        assert!(response[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_response_is_deterministic_and_keyed() {
        let a = challenge_response("secret", "cafe");
        let b = challenge_response("secret", "cafe");
        let c = challenge_response("other", "cafe");
        let d = challenge_response("secret", "beef");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_extract_challenge() {
        let reply = Sentence::from_words(vec!["!done".into(), "=ret=deadbeef".into()]);
        assert_eq!(extract_challenge(&reply).unwrap(), "deadbeef");

        let no_ret = Sentence::from_words(vec!["!done".into()]);
        assert!(extract_challenge(&no_ret).is_err());

        let trap = Sentence::from_words(vec!["!trap".into(), "=message=denied".into()]);
        let err = extract_challenge(&trap).unwrap_err();
        assert!(matches!(err, RosSrvError::AuthenticationError(_)));
    }

    #[test]
    fn test_login_sentences() {
        let probe = build_login_probe();
        assert_eq!(probe.words(), &["/login".to_string()]);

        let plain = build_plain_login("admin", "pw");
        assert_eq!(plain.attribute("name"), Some("admin"));
        assert_eq!(plain.attribute("password"), Some("pw"));

        let resp = build_login_response("admin", "00ab");
        assert_eq!(resp.attribute("response"), Some("00ab"));
    }

    #[test]
    fn test_check_login_reply() {
        let done = Sentence::from_words(vec!["!done".into()]);
        assert!(check_login_reply(&done).is_ok());

        let trap = Sentence::from_words(vec!["!trap".into(), "=message=bad password".into()]);
        assert!(check_login_reply(&trap).is_err());
    }
}
