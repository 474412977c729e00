use std::collections::HashMap;
use std::net::Ipv4Addr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Assignable address window within one runner's subnet. Built by the
/// overlay manager from the subnet plan; carried here so the reservation
/// pool never needs to know the plan itself.
#[derive(Debug, Clone, Copy)]
pub struct IpRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub host_vxlan_ip: Ipv4Addr,
}

impl IpRange {
    fn contains(&self, ip: Ipv4Addr) -> bool {
        let (ip, first, last) = (u32::from(ip), u32::from(self.first), u32::from(self.last));
        ip >= first && ip <= last
    }
}

/// Signed claim payload embedded in a token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenPayload {
    pub ip: String,
    pub runner: String,
    pub exp: i64,
}

/// A live reservation. `container_id` is set once the reservation is used;
/// used reservations never expire on their own.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub ip: Ipv4Addr,
    pub runner_name: String,
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub container_id: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReservationError {
    #[error("ip {0} is not available")]
    IpUnavailable(Ipv4Addr),
    #[error("ip {0} is outside the runner subnet")]
    IpOutOfRange(Ipv4Addr),
    #[error("no free addresses left in the runner subnet")]
    PoolExhausted,
    #[error("token is malformed or has a bad signature")]
    InvalidToken,
    #[error("token has expired")]
    Expired,
    #[error("no reservation matches this token")]
    NotFound,
    #[error("token was issued for runner {actual}, expected {expected}")]
    RunnerMismatch { expected: String, actual: String },
}

/// In-memory IP reservation pool. All operations serialize through a single
/// async mutex; nothing survives a process restart, which is acceptable for
/// the short TTLs involved.
pub struct IpReservationService {
    state: Mutex<HashMap<String, Reservation>>,
    secret: Vec<u8>,
}

impl IpReservationService {
    /// `secret` signs tokens; pass None to generate a fresh key, invalidating
    /// tokens from any previous process.
    pub fn new(secret: Option<String>) -> Self {
        let secret = match secret {
            Some(s) => s.into_bytes(),
            None => rand::rng().random::<[u8; 32]>().to_vec(),
        };
        Self {
            state: Mutex::new(HashMap::new()),
            secret,
        }
    }

    /// Reserve an address for `runner`. When `requested_ip` is given it must
    /// be free; otherwise a uniformly random free address is chosen.
    pub async fn reserve(
        &self,
        runner: &str,
        range: IpRange,
        requested_ip: Option<Ipv4Addr>,
        ttl_secs: u64,
    ) -> Result<Reservation, ReservationError> {
        self.reserve_at(runner, range, requested_ip, ttl_secs, Utc::now().timestamp())
            .await
    }

    pub async fn reserve_at(
        &self,
        runner: &str,
        range: IpRange,
        requested_ip: Option<Ipv4Addr>,
        ttl_secs: u64,
        now: i64,
    ) -> Result<Reservation, ReservationError> {
        let mut state = self.state.lock().await;
        cleanup_expired(&mut state, now);

        let taken: std::collections::HashSet<Ipv4Addr> = state
            .values()
            .filter(|r| r.runner_name == runner)
            .map(|r| r.ip)
            .collect();

        let ip = match requested_ip {
            Some(ip) => {
                if !range.contains(ip) || ip == range.gateway || ip == range.host_vxlan_ip {
                    return Err(ReservationError::IpOutOfRange(ip));
                }
                if taken.contains(&ip) {
                    return Err(ReservationError::IpUnavailable(ip));
                }
                ip
            }
            None => {
                let free: Vec<Ipv4Addr> = free_addresses(&range, &taken);
                if free.is_empty() {
                    return Err(ReservationError::PoolExhausted);
                }
                free[rand::rng().random_range(0..free.len())]
            }
        };

        let expires_at = now + ttl_secs as i64;
        let token = encode_token(
            &TokenPayload {
                ip: ip.to_string(),
                runner: runner.to_string(),
                exp: expires_at,
            },
            &self.secret,
        );

        let reservation = Reservation {
            ip,
            runner_name: runner.to_string(),
            token: token.clone(),
            created_at: now,
            expires_at,
            container_id: None,
        };
        state.insert(token, reservation.clone());

        info!(runner = %runner, ip = %ip, ttl = ttl_secs, "Reserved overlay IP");
        Ok(reservation)
    }

    /// Validate a token: signature, expiry, live reservation, and (when
    /// given) the expected runner. Returns the decoded payload.
    pub async fn validate(
        &self,
        token: &str,
        expected_runner: Option<&str>,
    ) -> Result<TokenPayload, ReservationError> {
        self.validate_at(token, expected_runner, Utc::now().timestamp())
            .await
    }

    pub async fn validate_at(
        &self,
        token: &str,
        expected_runner: Option<&str>,
        now: i64,
    ) -> Result<TokenPayload, ReservationError> {
        let payload = decode_token(token, &self.secret)?;

        let state = self.state.lock().await;
        let reservation = state.get(token).ok_or(ReservationError::NotFound)?;

        // Used reservations stay valid past their stamp; reserved ones expire.
        if reservation.container_id.is_none() && payload.exp <= now {
            return Err(ReservationError::Expired);
        }

        if let Some(expected) = expected_runner {
            if payload.runner != expected {
                return Err(ReservationError::RunnerMismatch {
                    expected: expected.to_string(),
                    actual: payload.runner.clone(),
                });
            }
        }
        Ok(payload)
    }

    /// Bind a container to a reservation. From this point the reservation is
    /// immune to TTL expiry and is freed by container release.
    pub async fn use_reservation(
        &self,
        token: &str,
        container_id: &str,
    ) -> Result<Ipv4Addr, ReservationError> {
        self.use_reservation_at(token, container_id, Utc::now().timestamp())
            .await
    }

    pub async fn use_reservation_at(
        &self,
        token: &str,
        container_id: &str,
        now: i64,
    ) -> Result<Ipv4Addr, ReservationError> {
        decode_token(token, &self.secret)?;
        let mut state = self.state.lock().await;
        let reservation = state.get_mut(token).ok_or(ReservationError::NotFound)?;
        if reservation.container_id.is_none() && reservation.expires_at <= now {
            return Err(ReservationError::Expired);
        }
        reservation.container_id = Some(container_id.to_string());
        debug!(ip = %reservation.ip, container = %container_id, "Reservation bound to container");
        Ok(reservation.ip)
    }

    /// Drop a reservation that has not been used yet. Idempotent.
    pub async fn release_by_token(&self, token: &str) {
        let mut state = self.state.lock().await;
        if let Some(r) = state.get(token) {
            if r.container_id.is_none() {
                let ip = r.ip;
                state.remove(token);
                info!(ip = %ip, "Released reservation by token");
            }
        }
    }

    /// Drop every reservation bound to a container. Idempotent.
    pub async fn release_by_container(&self, container_id: &str) {
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|_, r| r.container_id.as_deref() != Some(container_id));
        let dropped = before - state.len();
        if dropped > 0 {
            info!(container = %container_id, count = dropped, "Released reservations for container");
        }
    }

    /// Free a specific address regardless of reservation state. Idempotent.
    pub async fn mark_ip_free(&self, runner: &str, ip: Ipv4Addr) {
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|_, r| !(r.runner_name == runner && r.ip == ip));
        if state.len() != before {
            info!(runner = %runner, ip = %ip, "Marked overlay IP free");
        }
    }

    /// Snapshot of live reservations (expired ones are dropped first).
    pub async fn list(&self, runner: Option<&str>) -> Vec<Reservation> {
        self.list_at(runner, Utc::now().timestamp()).await
    }

    pub async fn list_at(&self, runner: Option<&str>, now: i64) -> Vec<Reservation> {
        let mut state = self.state.lock().await;
        cleanup_expired(&mut state, now);
        let mut out: Vec<Reservation> = state
            .values()
            .filter(|r| runner.is_none_or(|name| r.runner_name == name))
            .cloned()
            .collect();
        out.sort_by_key(|r| u32::from(r.ip));
        out
    }

    /// Free addresses for a runner, for the `/overlay/ip/available` endpoint.
    pub async fn available(&self, runner: &str, range: IpRange) -> Vec<Ipv4Addr> {
        let mut state = self.state.lock().await;
        cleanup_expired(&mut state, Utc::now().timestamp());
        let taken: std::collections::HashSet<Ipv4Addr> = state
            .values()
            .filter(|r| r.runner_name == runner)
            .map(|r| r.ip)
            .collect();
        free_addresses(&range, &taken)
    }
}

/// Drop reservations that are past expiry and not bound to a container.
fn cleanup_expired(state: &mut HashMap<String, Reservation>, now: i64) {
    let before = state.len();
    state.retain(|_, r| r.container_id.is_some() || r.expires_at > now);
    let dropped = before - state.len();
    if dropped > 0 {
        debug!(count = dropped, "Dropped expired reservations");
    }
}

fn free_addresses(
    range: &IpRange,
    taken: &std::collections::HashSet<Ipv4Addr>,
) -> Vec<Ipv4Addr> {
    (u32::from(range.first)..=u32::from(range.last))
        .map(Ipv4Addr::from)
        .filter(|ip| *ip != range.gateway && *ip != range.host_vxlan_ip && !taken.contains(ip))
        .collect()
}

/// Token format: `base64url(payload_json + "." + hex(sha256(payload || secret))[..16])`.
fn encode_token(payload: &TokenPayload, secret: &[u8]) -> String {
    let json = serde_json::to_string(payload).expect("token payload serializes");
    let sig = sign(json.as_bytes(), secret);
    URL_SAFE_NO_PAD.encode(format!("{json}.{sig}"))
}

fn decode_token(token: &str, secret: &[u8]) -> Result<TokenPayload, ReservationError> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| ReservationError::InvalidToken)?;
    let text = String::from_utf8(raw).map_err(|_| ReservationError::InvalidToken)?;
    let (json, sig) = text.rsplit_once('.').ok_or(ReservationError::InvalidToken)?;

    let expected = sign(json.as_bytes(), secret);
    if expected.as_bytes().ct_eq(sig.as_bytes()).unwrap_u8() != 1 {
        return Err(ReservationError::InvalidToken);
    }
    serde_json::from_str(json).map_err(|_| ReservationError::InvalidToken)
}

fn sign(payload: &[u8], secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(secret);
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_range() -> IpRange {
        IpRange {
            first: "10.128.64.2".parse().unwrap(),
            last: "10.128.64.20".parse().unwrap(),
            gateway: "10.128.64.1".parse().unwrap(),
            host_vxlan_ip: "10.128.64.20".parse().unwrap(),
        }
    }

    fn svc() -> IpReservationService {
        IpReservationService::new(Some("test-secret".into()))
    }

    #[tokio::test]
    async fn reserve_specific_ip_and_validate() {
        let s = svc();
        let ip: Ipv4Addr = "10.128.64.5".parse().unwrap();
        let r = s
            .reserve_at("node1", test_range(), Some(ip), 300, 1000)
            .await
            .unwrap();
        assert_eq!(r.ip, ip);

        let payload = s.validate_at(&r.token, Some("node1"), 1100).await.unwrap();
        assert_eq!(payload.ip, "10.128.64.5");
        assert_eq!(payload.runner, "node1");
        assert_eq!(payload.exp, 1300);
    }

    #[tokio::test]
    async fn double_reserve_same_ip_fails() {
        let s = svc();
        let ip: Ipv4Addr = "10.128.64.5".parse().unwrap();
        s.reserve_at("node1", test_range(), Some(ip), 300, 1000)
            .await
            .unwrap();
        let err = s
            .reserve_at("node1", test_range(), Some(ip), 300, 1000)
            .await
            .unwrap_err();
        assert_eq!(err, ReservationError::IpUnavailable(ip));
    }

    #[tokio::test]
    async fn same_ip_different_runner_is_fine() {
        let s = svc();
        let ip: Ipv4Addr = "10.128.64.5".parse().unwrap();
        s.reserve_at("node1", test_range(), Some(ip), 300, 1000)
            .await
            .unwrap();
        s.reserve_at("node2", test_range(), Some(ip), 300, 1000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gateway_and_host_ip_are_never_assignable() {
        let s = svc();
        let range = test_range();
        assert!(s
            .reserve_at("node1", range, Some(range.gateway), 300, 1000)
            .await
            .is_err());
        assert!(s
            .reserve_at("node1", range, Some(range.host_vxlan_ip), 300, 1000)
            .await
            .is_err());

        let available = s.available("node1", range).await;
        assert!(!available.contains(&range.gateway));
        assert!(!available.contains(&range.host_vxlan_ip));
    }

    #[tokio::test]
    async fn random_pick_exhausts_pool() {
        let s = svc();
        // Range 10.128.64.2..=20 minus host_vxlan_ip(.20) = 18 addresses.
        for _ in 0..18 {
            s.reserve_at("node1", test_range(), None, 300, 1000)
                .await
                .unwrap();
        }
        let err = s
            .reserve_at("node1", test_range(), None, 300, 1000)
            .await
            .unwrap_err();
        assert_eq!(err, ReservationError::PoolExhausted);
    }

    #[tokio::test]
    async fn expired_reservation_is_collected_lazily() {
        let s = svc();
        let r = s
            .reserve_at("node1", test_range(), None, 300, 1000)
            .await
            .unwrap();

        // Not expired yet.
        assert!(s.validate_at(&r.token, None, 1299).await.is_ok());
        // Past expiry: validation fails and the next reserve sweeps it.
        assert_eq!(
            s.validate_at(&r.token, None, 1301).await.unwrap_err(),
            ReservationError::Expired
        );
        let r2 = s
            .reserve_at("node1", test_range(), Some(r.ip), 300, 1400)
            .await
            .unwrap();
        assert_eq!(r2.ip, r.ip);
    }

    // A used reservation outlives its TTL until its container releases it.
    #[tokio::test]
    async fn used_reservation_never_auto_expires() {
        let s = svc();
        let ip: Ipv4Addr = "10.128.64.5".parse().unwrap();
        let r = s
            .reserve_at("node1", test_range(), Some(ip), 300, 1000)
            .await
            .unwrap();
        s.use_reservation_at(&r.token, "cont-X", 1000).await.unwrap();

        // 301 seconds later the token is still valid.
        assert!(s.validate_at(&r.token, Some("node1"), 1301).await.is_ok());
        // And the IP is still taken.
        assert!(s
            .reserve_at("node1", test_range(), Some(ip), 300, 1301)
            .await
            .is_err());

        s.release_by_container("cont-X").await;
        assert!(s
            .reserve_at("node1", test_range(), Some(ip), 300, 1302)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn release_by_token_only_affects_unused() {
        let s = svc();
        let r = s
            .reserve_at("node1", test_range(), None, 300, 1000)
            .await
            .unwrap();
        s.use_reservation_at(&r.token, "cont-X", 1000).await.unwrap();

        // Used reservations are not droppable by token.
        s.release_by_token(&r.token).await;
        assert!(s.validate_at(&r.token, None, 1000).await.is_ok());

        s.release_by_container("cont-X").await;
        assert_eq!(
            s.validate_at(&r.token, None, 1000).await.unwrap_err(),
            ReservationError::NotFound
        );
    }

    #[tokio::test]
    async fn mark_ip_free_is_direct_and_idempotent() {
        let s = svc();
        let ip: Ipv4Addr = "10.128.64.7".parse().unwrap();
        let r = s
            .reserve_at("node1", test_range(), Some(ip), 300, 1000)
            .await
            .unwrap();
        s.use_reservation_at(&r.token, "cont-Y", 1000).await.unwrap();

        s.mark_ip_free("node1", ip).await;
        s.mark_ip_free("node1", ip).await; // second call is a no-op
        assert!(s
            .reserve_at("node1", test_range(), Some(ip), 300, 1000)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let s = svc();
        let r = s
            .reserve_at("node1", test_range(), None, 300, 1000)
            .await
            .unwrap();

        // Flip one character anywhere in the token.
        let mut chars: Vec<char> = r.token.chars().collect();
        let replacement = if chars[4] == 'A' { 'B' } else { 'A' };
        chars[4] = replacement;
        let tampered: String = chars.into_iter().collect();

        assert!(s.validate_at(&tampered, None, 1000).await.is_err());
    }

    #[tokio::test]
    async fn forged_payload_with_wrong_secret_is_rejected() {
        let s = svc();
        let forged = encode_token(
            &TokenPayload {
                ip: "10.128.64.9".into(),
                runner: "node1".into(),
                exp: i64::MAX,
            },
            b"other-secret",
        );
        assert_eq!(
            s.validate_at(&forged, None, 1000).await.unwrap_err(),
            ReservationError::InvalidToken
        );
    }

    #[tokio::test]
    async fn runner_mismatch_detected() {
        let s = svc();
        let r = s
            .reserve_at("node1", test_range(), None, 300, 1000)
            .await
            .unwrap();
        let err = s.validate_at(&r.token, Some("node2"), 1000).await.unwrap_err();
        assert!(matches!(err, ReservationError::RunnerMismatch { .. }));
    }

    #[test]
    fn token_payload_round_trip() {
        let payload = TokenPayload {
            ip: "10.128.64.5".into(),
            runner: "node1".into(),
            exp: 1_700_000_000,
        };
        let token = encode_token(&payload, b"secret");
        let decoded = decode_token(&token, b"secret").unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn signature_is_sixteen_hex_chars() {
        let sig = sign(b"payload", b"secret");
        assert_eq!(sig.len(), 16);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn list_filters_by_runner_and_sweeps() {
        let s = svc();
        s.reserve_at("node1", test_range(), Some("10.128.64.3".parse().unwrap()), 300, 1000)
            .await
            .unwrap();
        s.reserve_at("node2", test_range(), Some("10.128.64.4".parse().unwrap()), 100, 1000)
            .await
            .unwrap();

        assert_eq!(s.list_at(None, 1000).await.len(), 2);
        assert_eq!(s.list_at(Some("node1"), 1000).await.len(), 1);
        // node2's reservation expires at 1100.
        assert_eq!(s.list_at(None, 1200).await.len(), 1);
    }
}
