use std::net::SocketAddrV6;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use ring::digest;
use ring::hmac::SigningKey;
use rustls;

use crypto::reset_token_for;
use packet::ConnectionId;
use params::{PreferredAddress, TransportParameters};
use {MAX_CID_SIZE, MAX_PACKET_SIZE, MIN_CID_SIZE};

/// Initial transport parameters and connection-id sizing for a session
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Maximum number of bytes the peer may transmit on a bidirectional
    /// stream it did not initiate before becoming blocked
    pub max_stream_data_bidi_local: u64,
    /// Maximum number of bytes the peer may transmit on a bidirectional
    /// stream we initiated before becoming blocked
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
    /// Connection-level receive window
    pub max_data: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    /// Milliseconds; 0 disables the timer
    pub idle_timeout: u64,
    pub max_packet_size: u64,
    /// Milliseconds
    pub max_ack_delay: u64,
    /// Server only; advertised to clients for post-handshake migration
    pub preferred_address: Option<SocketAddrV6>,
    pub min_cid_len: usize,
    pub max_cid_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_stream_data_bidi_local: 256 * 1024,
            max_stream_data_bidi_remote: 256 * 1024,
            max_stream_data_uni: 256 * 1024,
            max_data: 1024 * 1024,
            max_streams_bidi: 100,
            max_streams_uni: 3,
            idle_timeout: 10 * 1000,
            max_packet_size: MAX_PACKET_SIZE as u64,
            max_ack_delay: 25,
            preferred_address: None,
            min_cid_len: MIN_CID_SIZE,
            max_cid_len: MAX_CID_SIZE,
        }
    }
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum ConfigError {
    #[fail(display = "illegal value for {}", _0)]
    IllegalValue(&'static str),
}

impl TransportConfig {
    pub fn reset_to_defaults(&mut self) {
        *self = TransportConfig::default();
    }

    /// Ingest caller-provided values, validating ranges
    pub fn set(
        &mut self,
        source: &TransportConfig,
        preferred_addr: Option<SocketAddrV6>,
    ) -> Result<(), ConfigError> {
        if source.max_packet_size > MAX_PACKET_SIZE as u64 || source.max_packet_size < 1200 {
            return Err(ConfigError::IllegalValue("max_packet_size"));
        }
        if source.max_ack_delay >= 1 << 14 {
            return Err(ConfigError::IllegalValue("max_ack_delay"));
        }
        if source.min_cid_len < MIN_CID_SIZE
            || source.max_cid_len > MAX_CID_SIZE
            || source.min_cid_len > source.max_cid_len
        {
            return Err(ConfigError::IllegalValue("cid_len"));
        }
        *self = source.clone();
        self.preferred_address = preferred_addr;
        Ok(())
    }

    /// Fill the transport parameters we will advertise. When
    /// `reset_key` is supplied a stateless-reset token for `scid` is
    /// included. Returns the CID allocated for the preferred address, if one
    /// was advertised; the caller must route it.
    pub fn to_settings(
        &self,
        params: &mut TransportParameters,
        scid: &ConnectionId,
        reset_key: Option<&SigningKey>,
        rng: &mut OsRng,
    ) -> Option<ConnectionId> {
        params.initial_max_stream_data_bidi_local = self.max_stream_data_bidi_local;
        params.initial_max_stream_data_bidi_remote = self.max_stream_data_bidi_remote;
        params.initial_max_stream_data_uni = self.max_stream_data_uni;
        params.initial_max_data = self.max_data;
        params.initial_max_streams_bidi = self.max_streams_bidi;
        params.initial_max_streams_uni = self.max_streams_uni;
        params.max_idle_timeout = self.idle_timeout;
        params.max_udp_payload_size = self.max_packet_size;
        params.max_ack_delay = self.max_ack_delay;
        if let Some(key) = reset_key {
            params.stateless_reset_token = Some(reset_token_for(key, scid));
        }
        if let Some(address) = self.preferred_address {
            let cid = ConnectionId::random(rng, self.max_cid_len);
            let token = match reset_key {
                Some(key) => reset_token_for(key, &cid),
                None => [0; ::RESET_TOKEN_SIZE],
            };
            params.preferred_address = Some(PreferredAddress {
                address,
                cid,
                stateless_reset_token: token,
            });
            Some(cid)
        } else {
            None
        }
    }
}

/// Parameters governing a session's loss detection, congestion response,
/// address validation, and TLS
pub struct Config {
    pub transport: TransportConfig,

    /// Maximum number of tail loss probes before an RTO fires.
    pub max_tlps: u32,
    /// Maximum reordering in packet number space before FACK style loss
    /// detection considers a packet lost.
    pub reordering_threshold: u32,
    /// Minimum time in the future a tail loss probe alarm may be set for (μs).
    pub min_tlp_timeout: u64,
    /// Minimum time in the future an RTO alarm may be set for (μs).
    pub min_rto_timeout: u64,
    /// The default RTT used before an RTT sample is taken (μs)
    pub default_initial_rtt: u64,

    /// Maximum segment size assumed by the default congestion controller.
    ///
    /// These four fields parameterize the bundled NewReno instance a
    /// session installs at creation; a controller supplied through
    /// `Session::set_congestion_controller` ignores them.
    pub default_mss: u64,
    /// The default controller's starting window, in bytes.
    pub initial_window: u64,
    /// Floor under the default controller's loss response.
    pub minimum_window: u64,
    /// Window reduction on a new loss event. 0.16 fixed point
    pub loss_reduction_factor: u16,

    /// Length of locally issued connection IDs. Must be between 4 and 18
    /// inclusive; the dispatcher routes on these.
    pub local_cid_len: usize,
    /// Number of connection IDs to keep issued to the peer beyond the one in
    /// use, enabling migration.
    pub issued_cid_count: usize,

    /// Server: require a retry round trip proving address ownership before
    /// committing session state.
    pub validate_address: bool,
    /// How long a retry token remains valid (μs)
    pub retry_token_expiration: u64,

    /// ALPN identifier for the protocol layered above; HTTP/3 when
    /// unspecified.
    pub alpn: String,

    pub tls_server_config: Arc<rustls::ServerConfig>,

    /// Key used to derive stateless reset tokens for locally issued CIDs.
    ///
    /// Preserve across restarts for better behavior toward clients of a
    /// previous instance.
    pub reset_key: SigningKey,
}

impl Default for Config {
    fn default() -> Self {
        const EXPECTED_RTT: u64 = 100; // ms
        let mut rng = OsRng::new().unwrap();
        let mut reset_value = [0; 64];
        rng.fill_bytes(&mut reset_value);
        Self {
            transport: TransportConfig::default(),

            max_tlps: 2,
            reordering_threshold: 3,
            min_tlp_timeout: 10 * 1000,
            min_rto_timeout: 200 * 1000,
            default_initial_rtt: EXPECTED_RTT * 1000,

            default_mss: 1460,
            initial_window: 10 * 1460,
            minimum_window: 2 * 1460,
            loss_reduction_factor: 0x8000, // 1/2

            local_cid_len: 8,
            issued_cid_count: 2,

            validate_address: false,
            retry_token_expiration: 10 * 1000 * 1000,

            alpn: "h3".into(),

            tls_server_config: Arc::new(rustls::ServerConfig::new(rustls::NoClientAuth::new())),

            reset_key: SigningKey::new(&digest::SHA512_256, &reset_value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_option_table() {
        let config = TransportConfig::default();
        assert_eq!(config.max_stream_data_bidi_local, 262_144);
        assert_eq!(config.max_stream_data_bidi_remote, 262_144);
        assert_eq!(config.max_stream_data_uni, 262_144);
        assert_eq!(config.max_data, 1_048_576);
        assert_eq!(config.max_streams_bidi, 100);
        assert_eq!(config.max_streams_uni, 3);
        assert_eq!(config.idle_timeout, 10_000);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut config = TransportConfig::default();
        config.max_data = 1;
        config.idle_timeout = 1;
        config.reset_to_defaults();
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn set_validates_ranges() {
        let mut config = TransportConfig::default();
        let mut source = TransportConfig::default();
        source.max_packet_size = 100;
        assert_matches!(config.set(&source, None), Err(ConfigError::IllegalValue(_)));

        let mut source = TransportConfig::default();
        source.min_cid_len = 1;
        assert_matches!(config.set(&source, None), Err(ConfigError::IllegalValue(_)));

        let source = TransportConfig::default();
        let addr = "[::1]:4433".parse().unwrap();
        config.set(&source, Some(addr)).unwrap();
        assert_eq!(config.preferred_address, Some(addr));
    }

    #[test]
    fn to_settings_allocates_reset_token() {
        let mut rng = OsRng::new().unwrap();
        let config = TransportConfig::default();
        let scid = ConnectionId::random(&mut rng, 8);
        let key = SigningKey::new(&digest::SHA512_256, &[0; 64]);

        let mut params = TransportParameters::default();
        assert!(config.to_settings(&mut params, &scid, None, &mut rng).is_none());
        assert!(params.stateless_reset_token.is_none());
        assert_eq!(params.initial_max_data, config.max_data);

        config.to_settings(&mut params, &scid, Some(&key), &mut rng);
        assert!(params.stateless_reset_token.is_some());
    }
}
