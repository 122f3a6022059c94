//! dbserver wire framing: typed fields and the `Message` envelope that
//! wraps them (spec.md §4.7/§6).

use std::{convert::TryInto, io::Write};

use anyhow::anyhow;
use byteorder::{BigEndian, WriteBytesExt};
use nom::{
    branch::alt,
    bytes::streaming::{tag, take},
    number::streaming::{be_u16, be_u32, be_u8},
    IResult,
};
use num_derive::FromPrimitive;
use strum::Display;

use crate::Result;

#[derive(Debug)]
#[repr(u8)]
enum FieldType {
    U8 = 0x0f,
    U16 = 0x10,
    U32 = 0x11,
    Blob = 0x14,
    String = 0x26,
}

/// A typed dbserver value: `NumberField` is split into 1/2/4-byte variants
/// on the wire (spec.md §4.7), matching `FieldType::{U8,U16,U32}` exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    U8(u8),
    U16(u16),
    U32(u32),
    Blob(Vec<u8>),
    String(String),
}

impl Field {
    pub fn encode(&self, mut w: impl Write) -> Result<()> {
        match self {
            Self::U8(val) => {
                w.write_u8(FieldType::U8 as u8)?;
                w.write_u8(*val)?;
            }
            Self::U16(val) => {
                w.write_u8(FieldType::U16 as u8)?;
                w.write_u16::<BigEndian>(*val)?;
            }
            Self::U32(val) => {
                w.write_u8(FieldType::U32 as u8)?;
                w.write_u32::<BigEndian>(*val)?;
            }
            Self::Blob(val) => {
                w.write_u8(FieldType::Blob as u8)?;
                w.write_u32::<BigEndian>(val.len() as u32)?;
                w.write_all(val)?;
            }
            Self::String(val) => {
                let utf: Vec<u16> = val.encode_utf16().collect();
                w.write_u8(FieldType::String as u8)?;
                w.write_u32::<BigEndian>(utf.len() as u32)?;
                for point in utf {
                    w.write_u16::<BigEndian>(point)?;
                }
            }
        }
        Ok(())
    }

    /// Packs (device, menu, slot, track-type) into the composite number
    /// field the menu-request arguments use (spec.md §4.7).
    pub fn dmst(d: u8, m: u8, s: u8, t: u8) -> Field {
        Field::U32(((d as u32) << 24) | ((m as u32) << 16) | ((s as u32) << 8) | (t as u32))
    }

    pub fn parse(i: &[u8]) -> IResult<&[u8], Field> {
        alt((
            Self::parse_u8,
            Self::parse_u16,
            Self::parse_u32,
            Self::parse_blob,
            Self::parse_string,
        ))(i)
    }

    fn parse_u8(i: &[u8]) -> IResult<&[u8], Field> {
        let (i, val) = Self::parse_u8_val(i)?;
        Ok((i, Field::U8(val)))
    }

    fn parse_u8_val(i: &[u8]) -> IResult<&[u8], u8> {
        let (i, _) = tag(&[FieldType::U8 as u8])(i)?;
        let (i, val) = be_u8(i)?;
        Ok((i, val))
    }

    fn parse_u16(i: &[u8]) -> IResult<&[u8], Field> {
        let (i, val) = Self::parse_u16_val(i)?;
        Ok((i, Field::U16(val)))
    }

    fn parse_u16_val(i: &[u8]) -> IResult<&[u8], u16> {
        let (i, _) = tag(&[FieldType::U16 as u8])(i)?;
        let (i, val) = be_u16(i)?;
        Ok((i, val))
    }

    fn parse_u32(i: &[u8]) -> IResult<&[u8], Field> {
        let (i, val) = Self::parse_u32_val(i)?;
        Ok((i, Field::U32(val)))
    }

    fn parse_u32_val(i: &[u8]) -> IResult<&[u8], u32> {
        let (i, _) = tag(&[FieldType::U32 as u8])(i)?;
        let (i, val) = be_u32(i)?;
        Ok((i, val))
    }

    fn parse_blob(i: &[u8]) -> IResult<&[u8], Field> {
        let (i, val) = Self::parse_blob_val(i)?;
        Ok((i, Field::Blob(val)))
    }

    fn parse_blob_val(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
        let (i, _) = tag(&[FieldType::Blob as u8])(i)?;
        let (i, len) = be_u32(i)?;
        let (i, data) = take(len as usize)(i)?;
        Ok((i, data.to_vec()))
    }

    fn parse_string(i: &[u8]) -> IResult<&[u8], Field> {
        let (i, val) = Self::parse_string_val(i)?;
        Ok((i, Field::String(val)))
    }

    fn parse_string_val(i: &[u8]) -> IResult<&[u8], String> {
        let (i, _) = tag(&[FieldType::String as u8])(i)?;
        let (i, num_points) = be_u32(i)?;
        let mut data = Vec::with_capacity(num_points as usize);
        let data_i = i;
        let mut i = i;
        for _ in 0..num_points {
            let (i1, val) = be_u16(i)?;
            data.push(val);
            i = i1;
        }

        match String::from_utf16(&data) {
            Ok(s) => Ok((i, s.trim_end_matches('\0').into())),
            Err(_) => Err(nom::Err::Error(nom::error::Error::new(
                data_i,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }

    fn tag_u32(tag_val: u32) -> impl Fn(&[u8]) -> IResult<&[u8], ()> {
        move |i: &[u8]| -> IResult<&[u8], ()> {
            let (i, _) = tag(&[
                FieldType::U32 as u8,
                ((tag_val >> 24) & 0xff) as u8,
                ((tag_val >> 16) & 0xff) as u8,
                ((tag_val >> 8) & 0xff) as u8,
                (tag_val & 0xff) as u8,
            ])(i)?;
            Ok((i, ()))
        }
    }
}

/// The dbserver message magic. spec.md §4.7/§6 states `fa fb fc fd`; see
/// DESIGN.md's Open Question decisions for why this is followed literally
/// instead of the value real hardware uses.
const MESSAGE_MAGIC: u32 = 0xfafbfcfd;

/// Argument-type-array tags, distinct from the per-field wire tags above:
/// these describe the *argument slot*, not the encoded value.
const ARG_TAG_NUMBER: u8 = 0x06;
const ARG_TAG_STRING: u8 = 0x02;
const ARG_TAG_BINARY: u8 = 0x03;

/// One framed dbserver request/response (spec.md §3 "dbserver Message",
/// §4.7). `tx_id` is a transaction id the client increments per request;
/// `ty` selects the operation (setup, menu request, render, teardown, ...).
#[derive(Debug)]
pub struct Message {
    pub tx_id: u32,
    pub ty: u16,
    pub num_args: u8,
    pub arg_tags: Vec<u8>,
    pub args: Vec<Field>,
}

impl Message {
    pub fn new(tx_id: u32, ty: u16, args: Vec<Field>) -> Result<Message> {
        if args.len() > 12 {
            return Err(anyhow!("too many args").into());
        }

        let mut arg_tags = Vec::new();
        for arg in &args {
            let tag = match arg {
                Field::U8(_) | Field::U16(_) | Field::U32(_) => ARG_TAG_NUMBER,
                Field::Blob(_) => ARG_TAG_BINARY,
                Field::String(_) => ARG_TAG_STRING,
            };
            arg_tags.push(tag);
        }

        Ok(Message {
            tx_id,
            ty,
            num_args: args.len() as u8,
            arg_tags,
            args,
        })
    }

    pub fn arg_u32(&self, idx: usize) -> Result<u32> {
        match self.args.get(idx) {
            Some(Field::U32(val)) => Ok(*val),
            Some(Field::U16(val)) => Ok(*val as u32),
            Some(Field::U8(val)) => Ok(*val as u32),
            Some(other) => Err(anyhow!("wrong arg type: {:?}", other).into()),
            None => Err(anyhow!("index out of range").into()),
        }
    }

    pub fn arg_string<'a>(&'a self, idx: usize) -> Result<&'a String> {
        match self.args.get(idx) {
            Some(Field::String(val)) => Ok(val),
            Some(other) => Err(anyhow!("wrong arg type: {:?}", other).into()),
            None => Err(anyhow!("index out of range").into()),
        }
    }

    pub fn arg_blob<'a>(&'a self, idx: usize) -> Result<&'a Vec<u8>> {
        match self.args.get(idx) {
            Some(Field::Blob(val)) => Ok(val),
            Some(other) => Err(anyhow!("wrong arg type: {:?}", other).into()),
            None => Err(anyhow!("index out of range").into()),
        }
    }

    pub fn encode(&self, mut w: impl Write) -> Result<()> {
        Field::U32(MESSAGE_MAGIC).encode(&mut w)?;
        Field::U32(self.tx_id).encode(&mut w)?;
        Field::U16(self.ty).encode(&mut w)?;
        Field::U8(self.num_args).encode(&mut w)?;
        Field::Blob(self.arg_tags.clone()).encode(&mut w)?;

        for arg in &self.args {
            arg.encode(&mut w)?;
        }

        Ok(())
    }

    pub fn parse(i: &[u8]) -> IResult<&[u8], Message> {
        let (i, _) = Field::tag_u32(MESSAGE_MAGIC)(i)?;
        let (i, tx_id) = Field::parse_u32_val(i)?;
        let (i, ty) = Field::parse_u16_val(i)?;
        let (i, num_args) = Field::parse_u8_val(i)?;
        let (i, tags) = Field::parse_blob_val(i)?;

        let mut args = Vec::new();
        let mut i = i;
        for _ in 0..num_args {
            let (i1, field) = Field::parse(i)?;
            args.push(field);
            i = i1;
        }

        Ok((
            i,
            Message {
                tx_id,
                ty,
                num_args,
                arg_tags: tags,
                args,
            },
        ))
    }
}

/// Message types used by the dbserver client (spec.md §4.7).
pub mod message_type {
    pub const SETUP_REQ: u16 = 0x0000;
    pub const MENU_REQ: u16 = 0x1000;
    pub const MENU_HEADER: u16 = 0x3000;
    pub const MENU_ITEM: u16 = 0x4101;
    pub const MENU_FOOTER: u16 = 0x4201;
    pub const RENDER_MENU_REQ: u16 = 0x3001;
    pub const TEARDOWN_REQ: u16 = 0x0010;
}

#[derive(Debug, Display, FromPrimitive, PartialEq)]
#[repr(u32)]
pub enum MenuItemType {
    Folder = 0x0001,
    AlbumTitle = 0x0002,
    Disc = 0x0003,
    TrackTitle = 0x0004,
    Genre = 0x0006,
    Artist = 0x0007,
    Playlist = 0x0008,
    Rating = 0x000a,
    Duration = 0x000b,
    Tempo = 0x000d,
    Label = 0x000e,
    Key = 0x000f,
    BitRate = 0x0010,
    Year = 0x0011,
    ColorNone = 0x0013,
    ColorPink = 0x0014,
    ColorRed = 0x0015,
    ColorOrange = 0x0016,
    ColorYellow = 0x0017,
    ColorGreen = 0x0018,
    ColorAqua = 0x0019,
    ColorBlue = 0x001a,
    ColorPurple = 0x001b,
    Comment = 0x023,
    HistoryPlaylist = 0x24,
    OriginalArtist = 0x28,
    Remixer = 0x29,
    DateAdded = 0x2e,
    GenreMenu = 0x80,
    ArtistMenu = 0x81,
    AlbumMenu = 0x82,
    TrackMenu = 0x83,
    PlaylistMenu = 0x84,
    BpmMenu = 0x85,
    RatingMenu = 0x86,
    YearMenu = 0x87,
    RemixerMenu = 0x88,
    LabelMenu = 0x89,
    OriginalArtistMenu = 0x8a,
    KeyMenu = 0x8b,
    ColorMenu = 0x8e,
    FolderMenu = 0x90,
    SearchMenu = 0x91,
    TimeMenu = 0x92,
    BitRateMenu = 0x93,
    FilenameMenu = 0x94,
    HistoryMenu = 0x95,
    All = 0xa0,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::new(
            1,
            message_type::MENU_REQ,
            vec![Field::dmst(1, 2, 1, 1), Field::U32(0)],
        )
        .unwrap();
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        let (rest, parsed) = Message::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.tx_id, 1);
        assert_eq!(parsed.ty, message_type::MENU_REQ);
        assert_eq!(parsed.arg_u32(0).unwrap(), Field::dmst(1, 2, 1, 1).as_u32());
    }

    impl Field {
        fn as_u32(&self) -> u32 {
            match self {
                Field::U32(v) => *v,
                _ => panic!("not a u32 field"),
            }
        }
    }

    #[test]
    fn test_string_field_roundtrip() {
        let field = Field::String("Track Title".to_string());
        let mut buf = Vec::new();
        field.encode(&mut buf).unwrap();
        let (rest, parsed) = Field::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, field);
    }
}
