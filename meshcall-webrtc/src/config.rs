use meshcall_media::TrackCodec;
use meshcall_protocol::ice::{IceConfig, IceServer};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

pub const PEER_EVENTS_CAPACITY: usize = 128;
pub const REMOTE_PACKETS_CAPACITY: usize = 256;
pub const RTCP_BUFFER_SIZE: usize = 1500;

pub trait IntoRtc<T> {
    fn into_rtc(self) -> T;
}

impl IntoRtc<RTCIceServer> for &IceServer {
    fn into_rtc(self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl IntoRtc<RTCConfiguration> for &IceConfig {
    fn into_rtc(self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.servers.iter().map(IntoRtc::into_rtc).collect(),
            ..Default::default()
        }
    }
}

impl IntoRtc<RTCRtpCodecCapability> for &TrackCodec {
    fn into_rtc(self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.mime_type.clone(),
            clock_rate: self.clock_rate,
            channels: self.channels,
            ..Default::default()
        }
    }
}
