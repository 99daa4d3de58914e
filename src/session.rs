//! An `RfbSession` terminates RFB as a client against one upstream VNC
//! server, keeps a [`Framebuffer`] in sync with it, and accepts outbound
//! input events to forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{GatewayError, Result};
use crate::framebuffer::Framebuffer;
use crate::protocol::{
    self, PixelFormat, RectHeader, ServerInit, CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT,
    ENCODING_COPYRECT, ENCODING_DESKTOP_SIZE, ENCODING_RAW, SECURITY_TYPE_NONE,
    SECURITY_TYPE_VNC_AUTH, SERVER_MSG_BELL, SERVER_MSG_FRAMEBUFFER_UPDATE,
    SERVER_MSG_SERVER_CUT_TEXT, SERVER_MSG_SET_COLOUR_MAP_ENTRIES,
};

/// A live connection to one upstream RFB server.
///
/// Reads are owned by [`RfbSession::run`]; writes (input events and
/// framebuffer update requests) go through `write_half`, serialized by
/// `write_lock` so the read loop's periodic update requests never interleave
/// with a subscriber's input event mid-message.
pub struct RfbSession {
    write_half: AsyncMutex<OwnedWriteHalf>,
    pub framebuffer: Arc<Framebuffer>,
    running: AtomicBool,
    pub host: String,
    pub port: u16,
}

impl RfbSession {
    /// Connects to `host:port`, performs the full RFB handshake (version
    /// negotiation, security handshake, `ClientInit`/`ServerInit`, and the
    /// gateway's fixed `SetPixelFormat`/`SetEncodings`), and returns a ready
    /// session along with the read half to drive via [`RfbSession::run`].
    pub async fn connect(host: &str, port: u16) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        negotiate_version(&mut read_half, &mut write_half).await?;
        negotiate_security(&mut read_half, &mut write_half).await?;

        // ClientInit: shared-flag = 1 (share the desktop with other clients).
        write_half.write_all(&[1]).await?;

        let server_init = read_server_init(&mut read_half).await?;
        info!(
            "connected to {}:{} ({}x{}, \"{}\")",
            host, port, server_init.framebuffer_width, server_init.framebuffer_height, server_init.name
        );

        let gateway_format = PixelFormat::gateway_format();
        write_half
            .write_all(&protocol::encode_set_pixel_format(&gateway_format))
            .await?;
        write_half.write_all(&protocol::encode_set_encodings()).await?;

        let framebuffer = Arc::new(Framebuffer::new(
            server_init.framebuffer_width,
            server_init.framebuffer_height,
        ));

        let session = Arc::new(Self {
            write_half: AsyncMutex::new(write_half),
            framebuffer,
            running: AtomicBool::new(true),
            host: host.to_string(),
            port,
        });

        // Initial non-incremental request for the whole screen.
        session
            .request_update(false, 0, 0, server_init.framebuffer_width, server_init.framebuffer_height)
            .await?;

        Ok((session, read_half))
    }

    /// Drives the read loop until the connection closes or an unrecoverable
    /// protocol error occurs. After each server message is processed, an
    /// incremental full-screen update is requested — this mirrors the
    /// reference implementation's always-request-after-processing behavior
    /// rather than a damage-driven request schedule.
    pub async fn run(self: &Arc<Self>, mut read_half: OwnedReadHalf) -> Result<()> {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        while self.running.load(Ordering::Acquire) {
            let message_type = read_u8(&mut read_half).await?;
            match message_type {
                SERVER_MSG_FRAMEBUFFER_UPDATE => self.handle_framebuffer_update(&mut read_half, &mut buf).await?,
                SERVER_MSG_SET_COLOUR_MAP_ENTRIES => self.skip_set_colour_map_entries(&mut read_half).await?,
                SERVER_MSG_BELL => debug!("bell from {}:{}", self.host, self.port),
                SERVER_MSG_SERVER_CUT_TEXT => self.skip_server_cut_text(&mut read_half).await?,
                other => return Err(GatewayError::UnknownMessageType(other)),
            }
            let (width, height) = self.framebuffer.dimensions();
            if let Err(err) = self.request_update(true, 0, 0, width, height).await {
                warn!("failed to request update from {}:{}: {err}", self.host, self.port);
                break;
            }
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Stops the read loop after the current message finishes processing.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Sends a `FramebufferUpdateRequest`.
    pub async fn request_update(&self, incremental: bool, x: u16, y: u16, width: u16, height: u16) -> Result<()> {
        let buf = protocol::encode_framebuffer_update_request(incremental, x, y, width, height);
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(&buf).await?;
        Ok(())
    }

    /// Requests a full, non-incremental redraw of the current framebuffer.
    pub async fn request_full_frame(&self) -> Result<()> {
        let (width, height) = self.framebuffer.dimensions();
        self.request_update(false, 0, 0, width, height).await
    }

    /// Sends a `PointerEvent`.
    pub async fn send_pointer_event(&self, button_mask: u8, x: u16, y: u16) -> Result<()> {
        let buf = protocol::encode_pointer_event(button_mask, x, y);
        debug_assert_eq!(buf[0], CLIENT_MSG_POINTER_EVENT);
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(&buf).await?;
        Ok(())
    }

    /// Sends a `KeyEvent`.
    pub async fn send_key_event(&self, down: bool, keysym: u32) -> Result<()> {
        let buf = protocol::encode_key_event(down, keysym);
        debug_assert_eq!(buf[0], CLIENT_MSG_KEY_EVENT);
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(&buf).await?;
        Ok(())
    }

    async fn handle_framebuffer_update(&self, read_half: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<()> {
        let _padding = read_u8(read_half).await?;
        let rect_count = read_u16(read_half).await?;
        for _ in 0..rect_count {
            let header = read_rect_header(read_half).await?;
            match header.encoding {
                ENCODING_RAW => self.apply_raw_rect(read_half, buf, &header).await?,
                ENCODING_COPYRECT => self.apply_copy_rect(read_half, &header).await?,
                ENCODING_DESKTOP_SIZE => {
                    self.framebuffer.resize(header.width, header.height);
                    info!("{}:{} resized to {}x{}", self.host, self.port, header.width, header.height);
                    // The reference implementation re-requests the whole new
                    // frame immediately rather than waiting for the next
                    // periodic request, since nothing about the new area is
                    // known yet.
                    self.request_update(false, 0, 0, header.width, header.height).await?;
                }
                other => return Err(GatewayError::UnsupportedEncoding(other)),
            }
        }
        Ok(())
    }

    async fn apply_raw_rect(&self, read_half: &mut OwnedReadHalf, buf: &mut BytesMut, header: &RectHeader) -> Result<()> {
        let byte_len = usize::from(header.width) * usize::from(header.height) * 4;
        buf.resize(byte_len, 0);
        read_half.read_exact(&mut buf[..byte_len]).await?;
        let rgb = protocol::bgrx_to_rgb(&buf[..byte_len], header.width, header.height);
        self.framebuffer.paste(header.x, header.y, header.width, header.height, &rgb);
        Ok(())
    }

    async fn apply_copy_rect(&self, read_half: &mut OwnedReadHalf, header: &RectHeader) -> Result<()> {
        let src_x = read_u16(read_half).await?;
        let src_y = read_u16(read_half).await?;
        self.framebuffer.copy_region(src_x, src_y, header.x, header.y, header.width, header.height);
        Ok(())
    }

    async fn skip_set_colour_map_entries(&self, read_half: &mut OwnedReadHalf) -> Result<()> {
        let _padding = read_u8(read_half).await?;
        let _first_colour = read_u16(read_half).await?;
        let colour_count = read_u16(read_half).await?;
        let mut discard = vec![0u8; usize::from(colour_count) * 6];
        read_half.read_exact(&mut discard).await?;
        Ok(())
    }

    async fn skip_server_cut_text(&self, read_half: &mut OwnedReadHalf) -> Result<()> {
        let mut padding = [0u8; 3];
        read_half.read_exact(&mut padding).await?;
        let length = read_u32(read_half).await?;
        let mut discard = vec![0u8; length as usize];
        read_half.read_exact(&mut discard).await?;
        Ok(())
    }
}

async fn negotiate_version(read_half: &mut OwnedReadHalf, write_half: &mut OwnedWriteHalf) -> Result<()> {
    let mut server_version = [0u8; 12];
    read_half.read_exact(&mut server_version).await?;
    if !server_version.starts_with(b"RFB ") {
        return Err(GatewayError::Handshake(format!(
            "unexpected protocol version banner: {:?}",
            String::from_utf8_lossy(&server_version)
        )));
    }
    write_half.write_all(protocol::PROTOCOL_VERSION).await?;
    Ok(())
}

async fn negotiate_security(read_half: &mut OwnedReadHalf, write_half: &mut OwnedWriteHalf) -> Result<()> {
    let security_type_count = read_u8(read_half).await?;
    if security_type_count == 0 {
        return Err(handshake_failure_reason(read_half).await);
    }
    let mut security_types = vec![0u8; usize::from(security_type_count)];
    read_half.read_exact(&mut security_types).await?;

    if security_types.contains(&SECURITY_TYPE_NONE) {
        write_half.write_all(&[SECURITY_TYPE_NONE]).await?;
    } else if security_types.contains(&SECURITY_TYPE_VNC_AUTH) {
        // Select VNC-auth so the server proceeds far enough to hand us its
        // 16-byte DES challenge, matching what is observable on the wire,
        // but we have no password to respond with: surface a typed error
        // rather than guessing with a zero-filled response.
        write_half.write_all(&[SECURITY_TYPE_VNC_AUTH]).await?;
        let mut challenge = [0u8; 16];
        read_half.read_exact(&mut challenge).await?;
        return Err(GatewayError::AuthenticationRequired);
    } else {
        return Err(GatewayError::Handshake(format!(
            "no supported security type among {security_types:?}"
        )));
    }

    let security_result = read_u32(read_half).await?;
    if security_result != 0 {
        return Err(GatewayError::SecurityRejected);
    }
    Ok(())
}

async fn handshake_failure_reason(read_half: &mut OwnedReadHalf) -> GatewayError {
    match read_u32(read_half).await {
        Ok(length) => {
            let mut reason = vec![0u8; length as usize];
            if read_half.read_exact(&mut reason).await.is_ok() {
                return GatewayError::Handshake(String::from_utf8_lossy(&reason).into_owned());
            }
            GatewayError::Handshake("server rejected connection".to_string())
        }
        Err(_) => GatewayError::Handshake("server rejected connection".to_string()),
    }
}

async fn read_server_init(read_half: &mut OwnedReadHalf) -> Result<ServerInit> {
    let framebuffer_width = read_u16(read_half).await?;
    let framebuffer_height = read_u16(read_half).await?;
    let mut pixel_format_bytes = BytesMut::zeroed(16);
    read_half.read_exact(&mut pixel_format_bytes).await?;
    let pixel_format = PixelFormat::from_bytes(&mut pixel_format_bytes)?;
    let name_length = read_u32(read_half).await?;
    let mut name_bytes = vec![0u8; name_length as usize];
    read_half.read_exact(&mut name_bytes).await?;
    Ok(ServerInit {
        framebuffer_width,
        framebuffer_height,
        pixel_format,
        name: String::from_utf8_lossy(&name_bytes).into_owned(),
    })
}

async fn read_rect_header(read_half: &mut OwnedReadHalf) -> Result<RectHeader> {
    let x = read_u16(read_half).await?;
    let y = read_u16(read_half).await?;
    let width = read_u16(read_half).await?;
    let height = read_u16(read_half).await?;
    let encoding = read_u32(read_half).await? as i32;
    Ok(RectHeader { x, y, width, height, encoding })
}

async fn read_u8(read_half: &mut OwnedReadHalf) -> Result<u8> {
    let mut byte = [0u8; 1];
    read_half.read_exact(&mut byte).await?;
    Ok(byte[0])
}

async fn read_u16(read_half: &mut OwnedReadHalf) -> Result<u16> {
    let mut bytes = [0u8; 2];
    read_half.read_exact(&mut bytes).await?;
    let mut buf = BytesMut::from(&bytes[..]);
    Ok(buf.get_u16())
}

async fn read_u32(read_half: &mut OwnedReadHalf) -> Result<u32> {
    let mut bytes = [0u8; 4];
    read_half.read_exact(&mut bytes).await?;
    let mut buf = BytesMut::from(&bytes[..]);
    Ok(buf.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn rect_header_decodes_desktop_size_as_negative() {
        // Exercises the i32 cast path used by read_rect_header.
        let encoding_bytes: u32 = ENCODING_DESKTOP_SIZE as u32;
        assert_eq!(encoding_bytes as i32, ENCODING_DESKTOP_SIZE);
    }

    /// Scenario 1 from the gateway's testable properties: a mock upstream
    /// offering None security and a 1600x900 desktop, and the exact bytes
    /// the session emits during handshake.
    #[tokio::test]
    async fn connect_performs_byte_exact_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"RFB 003.008\n").await.unwrap();
            socket.write_all(&[0x01, 0x01]).await.unwrap(); // one security type: None
            socket.write_all(&[0x00, 0x00, 0x00, 0x00]).await.unwrap(); // security OK

            let mut client_version = [0u8; 12];
            socket.read_exact(&mut client_version).await.unwrap();
            assert_eq!(&client_version, b"RFB 003.008\n");
            let mut selected_security = [0u8; 1];
            socket.read_exact(&mut selected_security).await.unwrap();
            assert_eq!(selected_security, [0x01]);
            let mut client_init = [0u8; 1];
            socket.read_exact(&mut client_init).await.unwrap();
            assert_eq!(client_init, [0x01]);

            // ServerInit: 1600x900, arbitrary pixel format, empty name.
            socket.write_all(&1600u16.to_be_bytes()).await.unwrap();
            socket.write_all(&900u16.to_be_bytes()).await.unwrap();
            socket.write_all(&[0u8; 16]).await.unwrap();
            socket.write_all(&0u32.to_be_bytes()).await.unwrap();

            let mut set_pixel_format = [0u8; 20];
            socket.read_exact(&mut set_pixel_format).await.unwrap();
            assert_eq!(set_pixel_format.len(), 20);
            assert_eq!(set_pixel_format[0], protocol::CLIENT_MSG_SET_PIXEL_FORMAT);

            let mut set_encodings = [0u8; 16];
            socket.read_exact(&mut set_encodings).await.unwrap();
            assert_eq!(set_encodings[0], protocol::CLIENT_MSG_SET_ENCODINGS);

            let mut update_request = [0u8; 10];
            socket.read_exact(&mut update_request).await.unwrap();
            assert_eq!(
                update_request,
                [0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x40, 0x03, 0x84]
            );
        });

        let (session, _read_half) = RfbSession::connect(&addr.ip().to_string(), addr.port()).await.unwrap();
        assert_eq!(session.framebuffer.dimensions(), (1600, 900));
        server_task.await.unwrap();
    }
}
