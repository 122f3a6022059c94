//! A single dbserver TCP connection (spec.md §4.7): setup/teardown
//! handshake, a menu lock bounding the one-menu-session-per-connection
//! rule with a timeout, and the simpleRequest/menuRequest/renderMenuItems
//! API the Connection Manager calls against a pooled connection.
//!
//! Grounded on the teacher's `MetadataConnection` (`prolink/src/metadata.rs`):
//! same framing-loop shape (try to parse what's buffered, else read more),
//! generalized from one hardcoded request sequence into the general
//! request/response/menu-paging API spec.md §4.7 describes.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use num_traits::FromPrimitive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::message::{message_type, Field, MenuItemType, Message};
use crate::{DjLinkError, Result};

pub const DEFAULT_MENU_LOCK_TIMEOUT: Duration = Duration::from_secs(20);

/// One rendered row of a menu response, keyed by [`MenuItemType`] where the
/// wire value maps to a known variant.
#[derive(Debug, Clone, PartialEq)]
pub struct MenuItem {
    pub item_type: Option<MenuItemType>,
    pub raw_type: u32,
    pub number: u32,
    pub label: String,
}

/// A single dbserver TCP connection. Requests and replies are not
/// transaction-tagged by the device, so callers must await each reply
/// before issuing the next request on the same connection.
pub struct Client {
    stream: TcpStream,
    read_buf: BytesMut,
    tx_id: u32,
    menu_lock: Mutex<()>,
    menu_lock_timeout: Duration,
}

impl Client {
    /// Opens the TCP connection and runs the setup handshake: an initial
    /// probe word the device echoes back, then a `SETUP_REQ` naming our
    /// own device number (spec.md §4.7).
    pub async fn connect(
        addr: SocketAddr,
        our_device_num: u8,
        menu_lock_timeout: Duration,
    ) -> Result<Client> {
        let mut stream = TcpStream::connect(addr).await?;

        let mut hello = Vec::new();
        Field::U32(1).encode(&mut hello)?;
        stream.write_all(&hello).await?;
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await?;

        let mut client = Client {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            tx_id: 0,
            menu_lock: Mutex::new(()),
            menu_lock_timeout,
        };

        client
            .simple_request(
                message_type::SETUP_REQ,
                vec![Field::U32(our_device_num as u32)],
            )
            .await?;

        Ok(client)
    }

    fn next_tx_id(&mut self) -> u32 {
        self.tx_id = self.tx_id.wrapping_add(1);
        self.tx_id
    }

    async fn send(&mut self, ty: u16, args: Vec<Field>) -> Result<u32> {
        let tx_id = self.next_tx_id();
        let msg = Message::new(tx_id, ty, args)?;
        let mut buf = Vec::new();
        msg.encode(&mut buf)?;
        self.stream.write_all(&buf).await?;
        Ok(tx_id)
    }

    /// Reads from the socket until a complete message is buffered, per the
    /// framing pattern from https://tokio.rs/tokio/tutorial/framing — try
    /// to parse what we already have before reading more.
    async fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.try_parse()? {
                return Ok(msg);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(DjLinkError::ProtocolError(
                    "dbserver connection closed mid-message".to_string(),
                ));
            }
        }
    }

    fn try_parse(&mut self) -> Result<Option<Message>> {
        match Message::parse(&self.read_buf) {
            Ok((rest, msg)) => {
                let consumed = self.read_buf.len() - rest.len();
                let _ = self.read_buf.split_to(consumed);
                Ok(Some(msg))
            }
            Err(nom::Err::Incomplete(_)) => Ok(None),
            Err(_) => Err(DjLinkError::ProtocolError(
                "malformed dbserver message".to_string(),
            )),
        }
    }

    /// `simpleRequest` (spec.md §4.7): one request, one reply, no paging.
    pub async fn simple_request(&mut self, ty: u16, args: Vec<Field>) -> Result<Message> {
        self.send(ty, args).await?;
        self.recv().await
    }

    /// `menuRequest` + `renderMenuItems` (spec.md §4.7): issues a menu
    /// request, then pages through `RENDER_MENU_REQ` until `MENU_FOOTER`
    /// closes it. `args[0]` must be the `Field::dmst` composite number the
    /// request is keyed on. Holds the menu lock for the whole exchange,
    /// since the device allows only one open menu per connection, bounded
    /// by `menu_lock_timeout` so a caller can't wedge the connection
    /// forever.
    pub async fn menu_request(&mut self, ty: u16, args: Vec<Field>) -> Result<Vec<MenuItem>> {
        let _permit = timeout(self.menu_lock_timeout, self.menu_lock.lock())
            .await
            .map_err(|_| DjLinkError::MenuLockTimeout)?;

        let key = args
            .first()
            .cloned()
            .ok_or_else(|| DjLinkError::ProtocolError("menu_request needs a key arg".to_string()))?;

        self.send(ty, args).await?;
        let header = self.recv().await?;
        if header.ty != message_type::MENU_HEADER {
            return Err(DjLinkError::ProtocolError(format!(
                "expected MENU_HEADER, got {:#06x}",
                header.ty
            )));
        }

        let mut items = Vec::new();
        self.send(
            message_type::RENDER_MENU_REQ,
            vec![
                key,
                Field::U32(0),
                Field::U32(u32::MAX),
                Field::U32(0),
                Field::U32(u32::MAX),
                Field::U32(0),
            ],
        )
        .await?;

        loop {
            let msg = self.recv().await?;
            match msg.ty {
                message_type::MENU_ITEM => items.push(render_item(&msg)?),
                message_type::MENU_FOOTER => return Ok(items),
                _ => continue,
            }
        }
    }

    pub async fn teardown(&mut self) -> Result<()> {
        self.send(message_type::TEARDOWN_REQ, vec![]).await?;
        Ok(())
    }
}

fn render_item(msg: &Message) -> Result<MenuItem> {
    let raw_type = msg.arg_u32(1).unwrap_or(0);
    let item_type = MenuItemType::from_u32(raw_type);
    let number = msg.arg_u32(2).unwrap_or(0);
    let label = msg.arg_string(3).map(|s| s.clone()).unwrap_or_default();
    Ok(MenuItem {
        item_type,
        raw_type,
        number,
        label,
    })
}
