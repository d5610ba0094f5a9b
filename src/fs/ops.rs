//! File-system command operations
//!
//! The instruction-table entries bound to the tree: SELECT, the binary
//! and record families, GET/PUT DATA and CREATE/DELETE FILE. Handlers
//! take the raw P1/P2/body and return the full result; truncation to
//! Le and response chaining happen in the dispatcher.

use log::debug;

use crate::apdu::SW;
use crate::error::{CardResult, SwError};
use crate::tlv::{self, Tlv};

use super::{
    FciMode, FileBody, FileHeader, FileNode, FileTree, NodeId, Occurrence, Record, Selector,
    WriteCoding, FID_MF,
};

/// File reference data object used by the odd GET/PUT DATA variants.
const TAG_FILE_REFERENCE: u32 = 0x51;

impl FileTree {
    /// SELECT FILE: resolve per P1, render FCI per P2.
    pub fn cmd_select(&mut self, p1: u8, p2: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        let selector = match p1 {
            0x00 => {
                if data.is_empty() || data == [0x3F, 0x00] {
                    Selector::Mf
                } else if data.len() == 2 {
                    Selector::ChildFid(u16::from_be_bytes([data[0], data[1]]))
                } else {
                    return Err(SwError::incorrect_parameters());
                }
            }
            0x01 => {
                if data.len() != 2 {
                    return Err(SwError::incorrect_parameters());
                }
                Selector::ChildDf(u16::from_be_bytes([data[0], data[1]]))
            }
            0x02 => {
                if data.len() != 2 {
                    return Err(SwError::incorrect_parameters());
                }
                Selector::ChildEf(u16::from_be_bytes([data[0], data[1]]))
            }
            0x03 => Selector::Parent,
            0x04 => Selector::DfName {
                name: data.to_vec(),
                occurrence: Occurrence::from_p2(p2),
            },
            0x08 => Selector::PathFromMf(data.to_vec()),
            0x09 => Selector::PathFromCurrent(data.to_vec()),
            _ => return Err(SwError::incorrect_p1p2()),
        };
        let id = self.select(&selector)?;
        debug!(
            "selected file {:#06x}",
            self.node(id)?.header.fid
        );
        self.format_fci(id, FciMode::from_p2(p2)?)
    }

    // ------------------------------------------------------------------
    // Binary family
    // ------------------------------------------------------------------

    /// Resolve the target and offset of an even-INS binary command:
    /// P1 bit 8 set selects a short fid, otherwise P1P2 is a 15-bit
    /// offset into the current file.
    fn binary_target_even(&mut self, p1: u8, p2: u8) -> CardResult<(NodeId, usize)> {
        if p1 & 0x80 != 0 {
            let id = self.select(&Selector::ShortFid(p1 & 0x1F))?;
            Ok((id, p2 as usize))
        } else {
            Ok((self.current(), (((p1 as usize) & 0x7F) << 8) | p2 as usize))
        }
    }

    /// Resolve the target of an odd-INS binary command: P1P2 names a
    /// fid (0 meaning the current file), the body carries an offset
    /// data object.
    fn binary_target_odd(&mut self, p1: u8, p2: u8, body: &[Tlv]) -> CardResult<(NodeId, usize)> {
        let fid = u16::from_be_bytes([p1, p2]);
        let id = if fid == 0 {
            self.current()
        } else {
            self.select(&Selector::ChildFid(fid))?
        };
        let offset = tlv::find_first(body, tlv::TAG_OFFSET_DO)
            .and_then(tlv::unpack_offset_do)
            .ok_or_else(SwError::wrong_data)?;
        Ok((id, offset))
    }

    fn transparent(&self, id: NodeId) -> CardResult<&[u8]> {
        match &self.node(id)?.body {
            FileBody::Transparent { data, .. } => Ok(data),
            _ => Err(SwError::new(SW::COMMAND_INCOMPATIBLE)),
        }
    }

    /// READ BINARY. Returns everything from the offset on; the
    /// dispatcher truncates to Le.
    pub fn cmd_read_binary(&mut self, odd: bool, p1: u8, p2: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        let (id, offset) = if odd {
            let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
            self.binary_target_odd(p1, p2, &body)?
        } else {
            self.binary_target_even(p1, p2)?
        };
        let stored = self.transparent(id)?;
        if offset > stored.len() {
            return Err(SwError::offset_out_of_file());
        }
        Ok(stored[offset..].to_vec())
    }

    fn patch_binary(
        &mut self,
        id: NodeId,
        offset: usize,
        payload: &[u8],
        coding: Option<WriteCoding>,
    ) -> CardResult<()> {
        let node = self.node_mut(id)?;
        let (data, capacity, file_coding) = match &mut node.body {
            FileBody::Transparent {
                data,
                capacity,
                write_coding,
            } => (data, *capacity, *write_coding),
            _ => return Err(SwError::new(SW::COMMAND_INCOMPATIBLE)),
        };
        if offset > data.len() {
            return Err(SwError::offset_out_of_file());
        }
        let end = offset + payload.len();
        if let Some(capacity) = capacity {
            if end > capacity {
                return Err(SwError::not_enough_memory());
            }
        }
        if end > data.len() {
            data.resize(end, 0x00);
        }
        let coding = coding.unwrap_or(file_coding);
        for (index, &byte) in payload.iter().enumerate() {
            let stored = data[offset + index];
            data[offset + index] = coding.apply(stored, byte);
        }
        Ok(())
    }

    /// UPDATE BINARY: plain overwrite at the offset.
    pub fn cmd_update_binary(
        &mut self,
        odd: bool,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        let (id, offset, payload) = self.binary_write_args(odd, p1, p2, data)?;
        self.patch_binary(id, offset, &payload, Some(WriteCoding::OneTime))?;
        Ok(Vec::new())
    }

    /// WRITE BINARY: combine with the stored bytes per the file's
    /// write coding (one-time, OR, AND or proprietary XOR).
    pub fn cmd_write_binary(
        &mut self,
        odd: bool,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        let (id, offset, payload) = self.binary_write_args(odd, p1, p2, data)?;
        self.patch_binary(id, offset, &payload, None)?;
        Ok(Vec::new())
    }

    fn binary_write_args(
        &mut self,
        odd: bool,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<(NodeId, usize, Vec<u8>)> {
        if odd {
            let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
            let (id, offset) = self.binary_target_odd(p1, p2, &body)?;
            let payload = tlv::find_first(&body, tlv::TAG_DISCRETIONARY)
                .map(|t| t.value.clone())
                .ok_or_else(SwError::wrong_data)?;
            Ok((id, offset, payload))
        } else {
            let (id, offset) = self.binary_target_even(p1, p2)?;
            Ok((id, offset, data.to_vec()))
        }
    }

    /// ERASE BINARY: zero from the offset to an optional end offset
    /// (body, big-endian for the even INS, offset DO for the odd one),
    /// or to the end of the file.
    pub fn cmd_erase_binary(
        &mut self,
        odd: bool,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        let (id, start, end) = if odd {
            let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
            let (id, start) = self.binary_target_odd(p1, p2, &body)?;
            let offsets = tlv::find_all(&body, &[tlv::TAG_OFFSET_DO]);
            let end = offsets.get(1).and_then(|t| tlv::unpack_offset_do(t));
            (id, start, end)
        } else {
            let (id, start) = self.binary_target_even(p1, p2)?;
            let end = match data.len() {
                0 => None,
                2 => Some(u16::from_be_bytes([data[0], data[1]]) as usize),
                _ => return Err(SwError::wrong_data()),
            };
            (id, start, end)
        };
        let len = self.transparent(id)?.len();
        let end = end.unwrap_or(len);
        if start > len || end > len || start > end {
            return Err(SwError::offset_out_of_file());
        }
        if let FileBody::Transparent { data, .. } = &mut self.node_mut(id)?.body {
            for byte in &mut data[start..end] {
                *byte = 0x00;
            }
        }
        Ok(Vec::new())
    }

    /// SEARCH BINARY: find a byte string at or after the start offset;
    /// returns the two-byte big-endian offset of the first match.
    pub fn cmd_search_binary(
        &mut self,
        odd: bool,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        let (id, start, needle) = if odd {
            let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
            let (id, start) = self.binary_target_odd(p1, p2, &body)?;
            let needle = tlv::find_first(&body, tlv::TAG_DISCRETIONARY)
                .map(|t| t.value.clone())
                .ok_or_else(SwError::wrong_data)?;
            (id, start, needle)
        } else {
            let (id, start) = self.binary_target_even(p1, p2)?;
            (id, start, data.to_vec())
        };
        if needle.is_empty() {
            return Err(SwError::wrong_data());
        }
        let stored = self.transparent(id)?;
        if start > stored.len() {
            return Err(SwError::offset_out_of_file());
        }
        let found = stored[start..]
            .windows(needle.len())
            .position(|window| window == needle)
            .map(|pos| start + pos)
            .ok_or_else(SwError::data_not_found)?;
        Ok((found as u16).to_be_bytes().to_vec())
    }

    // ------------------------------------------------------------------
    // Record family
    // ------------------------------------------------------------------

    /// Resolve the record file addressed by P2: bits 8-4 may carry a
    /// short fid, zero meaning the current file.
    fn record_file(&mut self, p2: u8) -> CardResult<NodeId> {
        let sfid = p2 >> 3;
        if sfid == 0 {
            Ok(self.current())
        } else {
            self.select(&Selector::ShortFid(sfid))
        }
    }

    fn records(&self, id: NodeId) -> CardResult<&[Record]> {
        match &self.node(id)?.body {
            FileBody::Record { records, .. } => Ok(records),
            _ => Err(SwError::new(SW::COMMAND_INCOMPATIBLE)),
        }
    }

    /// Locate one record per the P2 addressing mode and update the
    /// cursor. Mode 4 addresses by number (P1, zero meaning current);
    /// modes 0..=3 address by identifier (P1, zero matching any)
    /// first/last/next/previous relative to the cursor.
    fn locate_record(&mut self, id: NodeId, p1: u8, mode: u8) -> CardResult<usize> {
        let (records_len, cursor) = match &self.node(id)?.body {
            FileBody::Record {
                records, cursor, ..
            } => (records.len(), *cursor),
            _ => return Err(SwError::new(SW::COMMAND_INCOMPATIBLE)),
        };
        let index = match mode {
            0x04 => {
                if p1 == 0 {
                    cursor.ok_or_else(SwError::record_not_found)?
                } else {
                    let index = p1 as usize - 1;
                    if index >= records_len {
                        return Err(SwError::record_not_found());
                    }
                    index
                }
            }
            0x00..=0x03 => {
                let matches: Vec<usize> = self
                    .records(id)?
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| p1 == 0 || r.identifier == p1)
                    .map(|(i, _)| i)
                    .collect();
                let found = match mode {
                    0x00 => matches.first().copied(),
                    0x01 => matches.last().copied(),
                    0x02 => match cursor {
                        Some(c) => matches.iter().copied().find(|&i| i > c),
                        None => matches.first().copied(),
                    },
                    _ => match cursor {
                        Some(c) => matches.iter().copied().rev().find(|&i| i < c),
                        None => matches.last().copied(),
                    },
                };
                found.ok_or_else(SwError::record_not_found)?
            }
            _ => return Err(SwError::incorrect_p1p2()),
        };
        if let FileBody::Record { cursor, .. } = &mut self.node_mut(id)?.body {
            *cursor = Some(index);
        }
        Ok(index)
    }

    /// READ RECORD. Modes 5 and 6 concatenate a range of records.
    pub fn cmd_read_record(
        &mut self,
        odd: bool,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        let id = self.record_file(p2)?;
        let mode = p2 & 0x07;
        match mode {
            0x05 => {
                // From record P1 up to the last.
                let records = self.records(id)?;
                if p1 == 0 || p1 as usize > records.len() {
                    return Err(SwError::record_not_found());
                }
                Ok(records[p1 as usize - 1..]
                    .iter()
                    .flat_map(|r| r.data.iter().copied())
                    .collect())
            }
            0x06 => {
                // From the last down to record P1.
                let records = self.records(id)?;
                if p1 == 0 || p1 as usize > records.len() {
                    return Err(SwError::record_not_found());
                }
                Ok(records[p1 as usize - 1..]
                    .iter()
                    .rev()
                    .flat_map(|r| r.data.iter().copied())
                    .collect())
            }
            _ => {
                let index = self.locate_record(id, p1, mode)?;
                let record = &self.records(id)?[index];
                if odd {
                    // The odd variant carries an offset DO into the record.
                    let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
                    let offset = tlv::find_first(&body, tlv::TAG_OFFSET_DO)
                        .and_then(tlv::unpack_offset_do)
                        .unwrap_or(0);
                    if offset > record.data.len() {
                        return Err(SwError::offset_out_of_file());
                    }
                    Ok(record.data[offset..].to_vec())
                } else {
                    Ok(record.data.clone())
                }
            }
        }
    }

    fn check_record_size(
        fixed_size: Option<usize>,
        payload_len: usize,
    ) -> CardResult<()> {
        if let Some(size) = fixed_size {
            if payload_len > size {
                return Err(SwError::not_enough_memory());
            }
        }
        Ok(())
    }

    /// APPEND RECORD: new record at the tail of a linear file or the
    /// head of a cyclic one; the cursor moves to the new record. In
    /// TLV-structured files the payload's leading byte is the record
    /// identifier.
    pub fn cmd_append_record(&mut self, p1: u8, p2: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        if p1 != 0 || p2 & 0x07 != 0 {
            return Err(SwError::incorrect_p1p2());
        }
        let id = self.record_file(p2)?;
        let tlv_structured = self.node(id)?.header.descriptor & 0x01 != 0
            && self.node(id)?.header.descriptor & 0x07 != 0x01;
        let record = if tlv_structured && !data.is_empty() {
            Record::new(data[0], data.to_vec()).map_err(|_| SwError::wrong_data())?
        } else {
            Record::unnumbered(data.to_vec())
        };
        match &mut self.node_mut(id)?.body {
            FileBody::Record {
                records,
                fixed_size,
                cyclic,
                cursor,
            } => {
                Self::check_record_size(*fixed_size, record.data.len())?;
                let mut record = record;
                if let Some(size) = *fixed_size {
                    record.data.resize(size, 0x00);
                }
                if *cyclic {
                    records.insert(0, record);
                    *cursor = Some(0);
                } else {
                    records.push(record);
                    *cursor = Some(records.len() - 1);
                }
                Ok(Vec::new())
            }
            _ => Err(SwError::new(SW::COMMAND_INCOMPATIBLE)),
        }
    }

    /// UPDATE RECORD: replace a located record's contents; the odd
    /// variant patches at an offset instead.
    pub fn cmd_update_record(
        &mut self,
        odd: bool,
        p1: u8,
        p2: u8,
        data: &[u8],
    ) -> CardResult<Vec<u8>> {
        let id = self.record_file(p2)?;
        let index = self.locate_record(id, p1, p2 & 0x07)?;
        let (offset, payload) = if odd {
            let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
            let offset = tlv::find_first(&body, tlv::TAG_OFFSET_DO)
                .and_then(tlv::unpack_offset_do)
                .unwrap_or(0);
            let payload = tlv::find_first(&body, tlv::TAG_DISCRETIONARY)
                .map(|t| t.value.clone())
                .ok_or_else(SwError::wrong_data)?;
            (offset, payload)
        } else {
            (0, data.to_vec())
        };
        match &mut self.node_mut(id)?.body {
            FileBody::Record {
                records,
                fixed_size,
                ..
            } => {
                let record = &mut records[index];
                let end = offset + payload.len();
                Self::check_record_size(*fixed_size, end)?;
                if offset > record.data.len() {
                    return Err(SwError::offset_out_of_file());
                }
                if odd {
                    if end > record.data.len() {
                        record.data.resize(end, 0x00);
                    }
                    record.data[offset..end].copy_from_slice(&payload);
                } else {
                    let mut data = payload;
                    if let Some(size) = *fixed_size {
                        data.resize(size, 0x00);
                    }
                    record.data = data;
                }
                Ok(Vec::new())
            }
            _ => Err(SwError::new(SW::COMMAND_INCOMPATIBLE)),
        }
    }

    /// WRITE RECORD: a one-time write, handled as a full replace.
    pub fn cmd_write_record(&mut self, p1: u8, p2: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        self.cmd_update_record(false, p1, p2, data)
    }

    /// ERASE RECORD: clear a located record (zeros when the size is
    /// fixed, empty otherwise).
    pub fn cmd_erase_record(&mut self, p1: u8, p2: u8) -> CardResult<Vec<u8>> {
        let id = self.record_file(p2)?;
        let index = self.locate_record(id, p1, p2 & 0x07)?;
        match &mut self.node_mut(id)?.body {
            FileBody::Record {
                records,
                fixed_size,
                ..
            } => {
                records[index].data = match fixed_size {
                    Some(size) => vec![0x00; *size],
                    None => Vec::new(),
                };
                Ok(Vec::new())
            }
            _ => Err(SwError::new(SW::COMMAND_INCOMPATIBLE)),
        }
    }

    // ------------------------------------------------------------------
    // Data objects
    // ------------------------------------------------------------------

    /// Apply an optional file-reference object from an odd-INS body.
    fn apply_file_reference(&mut self, body: &[Tlv]) -> CardResult<()> {
        if let Some(reference) = tlv::find_first(body, TAG_FILE_REFERENCE) {
            match reference.value.len() {
                2 => {
                    let fid = u16::from_be_bytes([reference.value[0], reference.value[1]]);
                    if fid == FID_MF {
                        let mf = self.mf();
                        self.set_current(mf);
                    } else {
                        self.select(&Selector::ChildFid(fid))?;
                    }
                }
                1 => {
                    self.select(&Selector::ShortFid(reference.value[0] >> 3))?;
                }
                _ => return Err(SwError::wrong_data()),
            }
        }
        Ok(())
    }

    /// GET DATA. The even INS addresses one tag through P1P2 (BER, or
    /// SIMPLE when P1 is zero and P2 below 0xFF); the odd INS takes a
    /// tag-list object, optionally behind a file reference.
    pub fn cmd_get_data(&mut self, odd: bool, p1: u8, p2: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        if odd {
            let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
            self.apply_file_reference(&body)?;
            let list = tlv::find_first(&body, tlv::TAG_TAG_LIST)
                .ok_or_else(SwError::wrong_data)?;
            let tags = tlv::unpack_tag_list(list).map_err(|_| SwError::wrong_data())?;
            let mut out = Vec::new();
            for tag in tags {
                out.extend(self.encoded_object(self.current(), tag)?);
            }
            Ok(out)
        } else if p1 == 0x00 && p2 != 0x00 && p2 != 0xFF {
            let node = self.node(self.current())?;
            let value = node
                .header
                .simple_objects
                .iter()
                .find(|(tag, _)| *tag == p2)
                .map(|(_, value)| value.clone())
                .ok_or_else(SwError::data_not_found)?;
            Ok(crate::tlv::encode_simple(&crate::tlv::SimpleTlv {
                tag: p2,
                value,
            }))
        } else {
            self.encoded_object(self.current(), ((p1 as u32) << 8) | p2 as u32)
        }
    }

    fn encoded_object(&self, id: NodeId, tag: u32) -> CardResult<Vec<u8>> {
        let node = self.node(id)?;
        node.header
            .data_objects
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(tag, value)| Tlv::new(*tag, value.clone()).to_bytes())
            .ok_or_else(SwError::data_not_found)
    }

    /// PUT DATA. The even INS stores the body under the P1P2 tag; the
    /// odd INS stores every object in the body, optionally behind a
    /// file reference.
    pub fn cmd_put_data(&mut self, odd: bool, p1: u8, p2: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        if odd {
            let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
            self.apply_file_reference(&body)?;
            let current = self.current();
            for object in &body {
                if object.tag == TAG_FILE_REFERENCE {
                    continue;
                }
                self.store_object(current, object.tag, object.value.clone())?;
            }
            Ok(Vec::new())
        } else if p1 == 0x00 && p2 != 0x00 && p2 != 0xFF {
            let node = self.node_mut(self.current())?;
            let objects = &mut node.header.simple_objects;
            match objects.iter_mut().find(|(tag, _)| *tag == p2) {
                Some((_, value)) => *value = data.to_vec(),
                None => objects.push((p2, data.to_vec())),
            }
            Ok(Vec::new())
        } else {
            let current = self.current();
            self.store_object(current, ((p1 as u32) << 8) | p2 as u32, data.to_vec())?;
            Ok(Vec::new())
        }
    }

    fn store_object(&mut self, id: NodeId, tag: u32, value: Vec<u8>) -> CardResult<()> {
        let node = self.node_mut(id)?;
        let objects = &mut node.header.data_objects;
        match objects.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, stored)) => *stored = value,
            None => objects.push((tag, value)),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // File management
    // ------------------------------------------------------------------

    /// CREATE FILE: decode the file control parameters and attach the
    /// new node under the current DF. A created DF becomes current.
    pub fn cmd_create_file(&mut self, data: &[u8]) -> CardResult<Vec<u8>> {
        let body = tlv::decode(data).map_err(|_| SwError::wrong_data())?;
        let fcp = body
            .iter()
            .find(|t| t.tag == 0x62 || t.tag == 0x6F)
            .ok_or_else(SwError::wrong_data)?;
        let node = decode_fcp(fcp)?;
        let df = self.current_df();
        let id = self.attach(df, node)?;
        self.set_current(id);
        Ok(Vec::new())
    }

    /// DELETE FILE: empty body deletes the current file, a two-byte
    /// body resolves a child fid, longer bodies a path.
    pub fn cmd_delete_file(&mut self, data: &[u8]) -> CardResult<Vec<u8>> {
        let id = match data.len() {
            0 => self.current(),
            2 => self.resolve(&Selector::ChildFid(u16::from_be_bytes([data[0], data[1]])))?,
            _ => self.resolve(&Selector::PathFromMf(data.to_vec()))?,
        };
        self.detach(id)?;
        Ok(Vec::new())
    }
}

/// Decode file control parameters into a node.
fn decode_fcp(fcp: &Tlv) -> CardResult<FileNode> {
    let fid = fcp
        .child(0x83)
        .filter(|t| t.value.len() == 2)
        .map(|t| u16::from_be_bytes([t.value[0], t.value[1]]))
        .ok_or_else(SwError::wrong_data)?;
    let descriptor_do = fcp.child(0x82).ok_or_else(SwError::wrong_data)?;
    if descriptor_do.value.is_empty() {
        return Err(SwError::wrong_data());
    }
    let descriptor = descriptor_do.value[0];

    let mut header = FileHeader::new(fid, descriptor);
    if let Some(sfid) = fcp.child(0x88) {
        if sfid.value.len() == 1 && sfid.value[0] != 0 {
            header = header
                .with_short_fid(sfid.value[0] >> 3)
                .map_err(|_| SwError::wrong_data())?;
        }
    }
    if let Some(lc) = fcp.child(0x8A) {
        if lc.value.len() == 1 {
            header.life_cycle = lc.value[0];
        }
    }

    if descriptor & 0x38 == 0x38 {
        let name = fcp.child(0x84).map(|t| t.value.clone());
        return FileNode::dedicated(header, name).map_err(|_| SwError::wrong_data());
    }

    match descriptor & 0x07 {
        0x01 => {
            let capacity = fcp
                .child(0x80)
                .or_else(|| fcp.child(0x81))
                .map(|t| t.value.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize));
            let data = vec![0x00; capacity.unwrap_or(0)];
            let mut node = FileNode::transparent(header, data, capacity);
            if descriptor_do.value.len() >= 2 {
                if let FileBody::Transparent { write_coding, .. } = &mut node.body {
                    *write_coding = WriteCoding::from_data_coding(descriptor_do.value[1]);
                }
            }
            Ok(node)
        }
        0x02 | 0x03 | 0x06 | 0x07 => {
            // Record structure; bytes 3..4 of the descriptor DO carry
            // the maximum record size.
            let fixed = match descriptor_do.value.len() {
                3 => Some(descriptor_do.value[2] as usize),
                4.. => Some(u16::from_be_bytes([
                    descriptor_do.value[2],
                    descriptor_do.value[3],
                ]) as usize),
                _ => None,
            }
            .filter(|&size| size > 0);
            let cyclic = descriptor & 0x06 == 0x06;
            FileNode::record(header, Vec::new(), fixed, cyclic)
                .map_err(|_| SwError::wrong_data())
        }
        0x04 | 0x05 => FileNode::record(header, Vec::new(), None, false)
            .map_err(|_| SwError::wrong_data()),
        _ => Err(SwError::wrong_data()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::TlvBuilder;

    fn tree_with_transparent() -> FileTree {
        let mut tree = FileTree::new();
        let mf = tree.mf();
        tree.plant(
            mf,
            FileNode::transparent(
                FileHeader::new(0x0101, 0x01).with_short_fid(1).unwrap(),
                b"hello world".to_vec(),
                Some(32),
            ),
        )
        .unwrap();
        tree.cmd_select(0x00, 0x0C, &[0x01, 0x01]).unwrap();
        tree
    }

    fn tree_with_records(cyclic: bool) -> FileTree {
        let mut tree = FileTree::new();
        let mf = tree.mf();
        let descriptor = if cyclic { 0x06 } else { 0x02 };
        tree.plant(
            mf,
            FileNode::record(
                FileHeader::new(0x0201, descriptor),
                vec![
                    Record::new(0x01, vec![0xAA; 4]).unwrap(),
                    Record::new(0x02, vec![0xBB; 4]).unwrap(),
                    Record::new(0x01, vec![0xCC; 4]).unwrap(),
                ],
                Some(4),
                cyclic,
            )
            .unwrap(),
        )
        .unwrap();
        tree.cmd_select(0x00, 0x0C, &[0x02, 0x01]).unwrap();
        tree
    }

    #[test]
    fn test_read_binary_even() {
        let mut tree = tree_with_transparent();
        let data = tree.cmd_read_binary(false, 0x00, 0x06, &[]).unwrap();
        assert_eq!(data, b"world");
    }

    #[test]
    fn test_read_binary_offset_past_end() {
        let mut tree = tree_with_transparent();
        let err = tree.cmd_read_binary(false, 0x00, 0x20, &[]).unwrap_err();
        assert_eq!(err.sw, SW::INCORRECT_P1_P2);
    }

    #[test]
    fn test_read_binary_short_fid() {
        let mut tree = tree_with_transparent();
        tree.cmd_select(0x00, 0x0C, &[]).unwrap(); // back to the MF
        let data = tree.cmd_read_binary(false, 0x81, 0x00, &[]).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn test_read_binary_odd_offset_do() {
        let mut tree = tree_with_transparent();
        let body = TlvBuilder::new().push(0x54, &[0x06]).build();
        let data = tree.cmd_read_binary(true, 0x00, 0x00, &body).unwrap();
        assert_eq!(data, b"world");
    }

    #[test]
    fn test_update_binary_grows_file() {
        let mut tree = tree_with_transparent();
        tree.cmd_update_binary(false, 0x00, 0x0B, b"!!").unwrap();
        let data = tree.cmd_read_binary(false, 0x00, 0x00, &[]).unwrap();
        assert_eq!(data, b"hello world!!");
    }

    #[test]
    fn test_update_binary_capacity() {
        let mut tree = tree_with_transparent();
        let err = tree
            .cmd_update_binary(false, 0x00, 0x00, &[0x55; 40])
            .unwrap_err();
        assert_eq!(err.sw, SW::NOT_ENOUGH_MEMORY);
    }

    #[test]
    fn test_write_binary_or_coding() {
        let mut tree = FileTree::new();
        let mf = tree.mf();
        let mut node =
            FileNode::transparent(FileHeader::new(0x0102, 0x01), vec![0xF0, 0x0F], None);
        if let FileBody::Transparent { write_coding, .. } = &mut node.body {
            *write_coding = WriteCoding::Or;
        }
        tree.plant(mf, node).unwrap();
        tree.cmd_select(0x00, 0x0C, &[0x01, 0x02]).unwrap();
        tree.cmd_write_binary(false, 0x00, 0x00, &[0x0F, 0xF0]).unwrap();
        let data = tree.cmd_read_binary(false, 0x00, 0x00, &[]).unwrap();
        assert_eq!(data, vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_erase_binary_range() {
        let mut tree = tree_with_transparent();
        tree.cmd_erase_binary(false, 0x00, 0x00, &[0x00, 0x05]).unwrap();
        let data = tree.cmd_read_binary(false, 0x00, 0x00, &[]).unwrap();
        assert_eq!(data, b"\0\0\0\0\0 world");
    }

    #[test]
    fn test_search_binary() {
        let mut tree = tree_with_transparent();
        let found = tree.cmd_search_binary(false, 0x00, 0x00, b"world").unwrap();
        assert_eq!(found, vec![0x00, 0x06]);
        let err = tree
            .cmd_search_binary(false, 0x00, 0x00, b"missing")
            .unwrap_err();
        assert_eq!(err.sw, SW::REFERENCED_DATA_NOT_FOUND);
    }

    #[test]
    fn test_read_record_by_number() {
        let mut tree = tree_with_records(false);
        let data = tree.cmd_read_record(false, 2, 0x04, &[]).unwrap();
        assert_eq!(data, vec![0xBB; 4]);
        // P1 = 0 re-reads the current record.
        let data = tree.cmd_read_record(false, 0, 0x04, &[]).unwrap();
        assert_eq!(data, vec![0xBB; 4]);
    }

    #[test]
    fn test_read_record_by_identifier_next() {
        let mut tree = tree_with_records(false);
        let first = tree.cmd_read_record(false, 0x01, 0x00, &[]).unwrap();
        assert_eq!(first, vec![0xAA; 4]);
        let next = tree.cmd_read_record(false, 0x01, 0x02, &[]).unwrap();
        assert_eq!(next, vec![0xCC; 4]);
        let err = tree.cmd_read_record(false, 0x01, 0x02, &[]).unwrap_err();
        assert_eq!(err.sw, SW::RECORD_NOT_FOUND);
        let previous = tree.cmd_read_record(false, 0x01, 0x03, &[]).unwrap();
        assert_eq!(previous, vec![0xAA; 4]);
    }

    #[test]
    fn test_read_record_range_modes() {
        let mut tree = tree_with_records(false);
        let from_two = tree.cmd_read_record(false, 2, 0x05, &[]).unwrap();
        assert_eq!(from_two.len(), 8);
        assert_eq!(&from_two[..4], &[0xBB; 4]);
        let reversed = tree.cmd_read_record(false, 2, 0x06, &[]).unwrap();
        assert_eq!(&reversed[..4], &[0xCC; 4]);
    }

    #[test]
    fn test_append_record_linear_and_cursor() {
        let mut tree = tree_with_records(false);
        tree.cmd_append_record(0, 0, &[0x11; 4]).unwrap();
        let data = tree.cmd_read_record(false, 4, 0x04, &[]).unwrap();
        assert_eq!(data, vec![0x11; 4]);
    }

    #[test]
    fn test_append_record_cyclic_inserts_at_head() {
        let mut tree = tree_with_records(true);
        tree.cmd_append_record(0, 0, &[0x11; 4]).unwrap();
        let head = tree.cmd_read_record(false, 1, 0x04, &[]).unwrap();
        assert_eq!(head, vec![0x11; 4]);
        // The cursor followed the insertion to the head.
        let current = tree.cmd_read_record(false, 0, 0x04, &[]).unwrap();
        assert_eq!(current, vec![0x11; 4]);
    }

    #[test]
    fn test_append_record_oversize_rejected() {
        let mut tree = tree_with_records(false);
        let err = tree.cmd_append_record(0, 0, &[0x11; 5]).unwrap_err();
        assert_eq!(err.sw, SW::NOT_ENOUGH_MEMORY);
    }

    #[test]
    fn test_update_and_erase_record() {
        let mut tree = tree_with_records(false);
        tree.cmd_update_record(false, 1, 0x04, &[0x44; 4]).unwrap();
        assert_eq!(
            tree.cmd_read_record(false, 1, 0x04, &[]).unwrap(),
            vec![0x44; 4]
        );
        tree.cmd_erase_record(1, 0x04).unwrap();
        assert_eq!(
            tree.cmd_read_record(false, 1, 0x04, &[]).unwrap(),
            vec![0x00; 4]
        );
    }

    #[test]
    fn test_get_put_data_ber() {
        let mut tree = tree_with_transparent();
        tree.cmd_put_data(false, 0x5F, 0x2D, b"en").unwrap();
        let out = tree.cmd_get_data(false, 0x5F, 0x2D, &[]).unwrap();
        assert_eq!(out, vec![0x5F, 0x2D, 0x02, b'e', b'n']);
        let err = tree.cmd_get_data(false, 0x5F, 0x2E, &[]).unwrap_err();
        assert_eq!(err.sw, SW::REFERENCED_DATA_NOT_FOUND);
    }

    #[test]
    fn test_get_data_simple() {
        let mut tree = tree_with_transparent();
        tree.cmd_put_data(false, 0x00, 0x10, &[0xAB]).unwrap();
        let out = tree.cmd_get_data(false, 0x00, 0x10, &[]).unwrap();
        assert_eq!(out, vec![0x10, 0x01, 0xAB]);
    }

    #[test]
    fn test_get_data_odd_with_file_reference() {
        let mut tree = tree_with_transparent();
        tree.cmd_put_data(false, 0x00, 0x5B, b"Doe").unwrap();
        tree.cmd_select(0x00, 0x0C, &[]).unwrap(); // deselect to MF
        let body = TlvBuilder::new()
            .push(0x51, &[0x01, 0x01])
            .push(0x5C, &[0x5B])
            .build();
        let out = tree.cmd_get_data(true, 0x00, 0x00, &body).unwrap();
        assert_eq!(out, vec![0x5B, 0x03, b'D', b'o', b'e']);
    }

    #[test]
    fn test_create_file_transparent_and_collision() {
        let mut tree = FileTree::new();
        let fcp = TlvBuilder::new()
            .push(0x83, &[0x01, 0x10])
            .push(0x82, &[0x01])
            .push(0x80, &[0x20])
            .wrap(0x62)
            .build();
        tree.cmd_create_file(&fcp).unwrap();
        let data = tree.cmd_read_binary(false, 0x00, 0x00, &[]).unwrap();
        assert_eq!(data, vec![0x00; 0x20]);

        tree.cmd_select(0x00, 0x0C, &[]).unwrap();
        let err = tree.cmd_create_file(&fcp).unwrap_err();
        assert_eq!(err.sw, SW::FILE_ALREADY_EXISTS);
    }

    #[test]
    fn test_create_file_reserved_fid() {
        let mut tree = FileTree::new();
        let fcp = TlvBuilder::new()
            .push(0x83, &[0x3F, 0xFF])
            .push(0x82, &[0x01])
            .wrap(0x62)
            .build();
        let err = tree.cmd_create_file(&fcp).unwrap_err();
        assert_eq!(err.sw, SW::INCORRECT_PARAMETERS);
    }

    #[test]
    fn test_create_df_with_name_and_delete() {
        let mut tree = FileTree::new();
        let fcp = TlvBuilder::new()
            .push(0x83, &[0x20, 0x00])
            .push(0x82, &[0x38])
            .push(0x84, b"newapp")
            .wrap(0x62)
            .build();
        tree.cmd_create_file(&fcp).unwrap();
        assert_eq!(
            tree.node(tree.current()).unwrap().df_name(),
            Some(&b"newapp"[..])
        );
        tree.cmd_delete_file(&[]).unwrap();
        assert!(tree
            .resolve(&Selector::ChildFid(0x2000))
            .is_err());
    }

    #[test]
    fn test_record_file_via_fcp() {
        let mut tree = FileTree::new();
        let fcp = TlvBuilder::new()
            .push(0x83, &[0x02, 0x10])
            .push(0x82, &[0x02, 0x21, 0x00, 0x08])
            .wrap(0x62)
            .build();
        tree.cmd_create_file(&fcp).unwrap();
        tree.cmd_append_record(0, 0, &[0x01, 0x02]).unwrap();
        // Fixed-size records are padded out to the declared size.
        let data = tree.cmd_read_record(false, 1, 0x04, &[]).unwrap();
        assert_eq!(data.len(), 8);
    }
}
