//! Schema-aware protobuf-lite codec.
//!
//! Hand-rolled encoder/decoder for the three mesh payload schemas. Only two
//! wire types are used: varint (0) and length-delimited (2). Zero/empty
//! fields are omitted on encode and default-filled on decode; unknown fields
//! are skipped.

use crate::compact::AddressInterner;
use crate::error::WireError;
use crate::types::{MeshMessage, MessageKind, UtxoBlock, UtxoInput, UtxoOutput, UtxoTransaction};
use crate::varint;

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

fn write_key(out: &mut Vec<u8>, field: u32, wire_type: u8) {
    varint::write_u32(out, (field << 3) | u32::from(wire_type));
}

fn write_u32_field(out: &mut Vec<u8>, field: u32, value: u32) {
    if value != 0 {
        write_key(out, field, WIRE_VARINT);
        varint::write_u32(out, value);
    }
}

fn write_bytes_field(out: &mut Vec<u8>, field: u32, value: &[u8]) {
    if !value.is_empty() {
        write_key(out, field, WIRE_LEN);
        varint::write_u32(out, value.len() as u32);
        out.extend_from_slice(value);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_varint(&mut self) -> Result<u32, WireError> {
        let (value, used) = varint::read_u32(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    fn read_key(&mut self) -> Result<(u32, u8), WireError> {
        let key = self.read_varint()?;
        Ok((key >> 3, (key & 0x07) as u8))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_varint()? as usize;
        if self.pos + len > self.data.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, wire_type: u8) -> Result<(), WireError> {
        match wire_type {
            WIRE_VARINT => {
                self.read_varint()?;
                Ok(())
            }
            WIRE_LEN => {
                self.read_bytes()?;
                Ok(())
            }
            other => Err(WireError::UnknownWireType(other)),
        }
    }
}

fn encode_input(out: &mut Vec<u8>, input: &UtxoInput) {
    write_bytes_field(out, 1, &input.tx_hash);
    write_u32_field(out, 2, input.output_index);
    write_bytes_field(out, 3, &input.script_sig);
}

fn decode_input(data: &[u8]) -> Result<UtxoInput, WireError> {
    let mut reader = Reader::new(data);
    let mut input = UtxoInput {
        tx_hash: Vec::new(),
        output_index: 0,
        script_sig: Vec::new(),
    };
    while !reader.done() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, WIRE_LEN) => input.tx_hash = reader.read_bytes()?.to_vec(),
            (2, WIRE_VARINT) => input.output_index = reader.read_varint()?,
            (3, WIRE_LEN) => input.script_sig = reader.read_bytes()?.to_vec(),
            (_, wt) => reader.skip(wt)?,
        }
    }
    Ok(input)
}

fn encode_output(out: &mut Vec<u8>, output: &UtxoOutput, interner: &mut AddressInterner) {
    write_u32_field(out, 1, output.amount);
    // Field 2 is the interned address id; id 0 is a valid first assignment,
    // so it is written unconditionally.
    write_key(out, 2, WIRE_VARINT);
    varint::write_u32(out, interner.intern(&output.address));
    write_bytes_field(out, 3, &output.script_pubkey);
}

fn decode_output(data: &[u8], interner: &AddressInterner) -> Result<UtxoOutput, WireError> {
    let mut reader = Reader::new(data);
    let mut amount = 0;
    let mut address_id = None;
    let mut script_pubkey = Vec::new();
    while !reader.done() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, WIRE_VARINT) => amount = reader.read_varint()?,
            (2, WIRE_VARINT) => address_id = Some(reader.read_varint()?),
            (3, WIRE_LEN) => script_pubkey = reader.read_bytes()?.to_vec(),
            (_, wt) => reader.skip(wt)?,
        }
    }
    let address = match address_id {
        Some(id) => interner.resolve(id)?.to_owned(),
        None => String::new(),
    };
    Ok(UtxoOutput {
        amount,
        address,
        script_pubkey,
    })
}

/// Encodes a `CompressedUTXOTransaction`.
pub fn encode_transaction(tx: &UtxoTransaction, interner: &mut AddressInterner) -> Vec<u8> {
    let mut out = Vec::with_capacity(tx.estimated_size());
    write_bytes_field(&mut out, 1, &tx.id);
    for input in &tx.inputs {
        let mut buf = Vec::new();
        encode_input(&mut buf, input);
        write_bytes_field(&mut out, 2, &buf);
    }
    for output in &tx.outputs {
        let mut buf = Vec::new();
        encode_output(&mut buf, output, interner);
        write_bytes_field(&mut out, 3, &buf);
    }
    write_u32_field(&mut out, 4, tx.fee);
    write_u32_field(&mut out, 5, tx.timestamp);
    write_bytes_field(&mut out, 6, &tx.signature);
    out
}

/// Decodes a `CompressedUTXOTransaction`. Address ids are resolved through
/// the session interner populated by previous decodes on the same session.
pub fn decode_transaction(
    data: &[u8],
    interner: &AddressInterner,
) -> Result<UtxoTransaction, WireError> {
    let mut reader = Reader::new(data);
    let mut tx = UtxoTransaction {
        id: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        fee: 0,
        timestamp: 0,
        signature: Vec::new(),
    };
    while !reader.done() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, WIRE_LEN) => tx.id = reader.read_bytes()?.to_vec(),
            (2, WIRE_LEN) => tx.inputs.push(decode_input(reader.read_bytes()?)?),
            (3, WIRE_LEN) => tx.outputs.push(decode_output(reader.read_bytes()?, interner)?),
            (4, WIRE_VARINT) => tx.fee = reader.read_varint()?,
            (5, WIRE_VARINT) => tx.timestamp = reader.read_varint()?,
            (6, WIRE_LEN) => tx.signature = reader.read_bytes()?.to_vec(),
            (_, wt) => reader.skip(wt)?,
        }
    }
    Ok(tx)
}

/// Encodes a `CompressedUTXOBlock`.
pub fn encode_block(block: &UtxoBlock, interner: &mut AddressInterner) -> Vec<u8> {
    let mut out = Vec::new();
    write_u32_field(&mut out, 1, block.index);
    write_u32_field(&mut out, 2, block.timestamp);
    for tx in &block.transactions {
        let buf = encode_transaction(tx, interner);
        write_bytes_field(&mut out, 3, &buf);
    }
    write_bytes_field(&mut out, 4, &block.previous_hash);
    write_bytes_field(&mut out, 5, &block.hash);
    write_bytes_field(&mut out, 6, &block.merkle_root);
    write_u32_field(&mut out, 7, block.nonce);
    write_u32_field(&mut out, 8, block.difficulty);
    out
}

/// Decodes a `CompressedUTXOBlock`.
pub fn decode_block(data: &[u8], interner: &AddressInterner) -> Result<UtxoBlock, WireError> {
    let mut reader = Reader::new(data);
    let mut block = UtxoBlock {
        index: 0,
        timestamp: 0,
        transactions: Vec::new(),
        previous_hash: Vec::new(),
        hash: Vec::new(),
        merkle_root: Vec::new(),
        nonce: 0,
        difficulty: 0,
    };
    while !reader.done() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, WIRE_VARINT) => block.index = reader.read_varint()?,
            (2, WIRE_VARINT) => block.timestamp = reader.read_varint()?,
            (3, WIRE_LEN) => block
                .transactions
                .push(decode_transaction(reader.read_bytes()?, interner)?),
            (4, WIRE_LEN) => block.previous_hash = reader.read_bytes()?.to_vec(),
            (5, WIRE_LEN) => block.hash = reader.read_bytes()?.to_vec(),
            (6, WIRE_LEN) => block.merkle_root = reader.read_bytes()?.to_vec(),
            (7, WIRE_VARINT) => block.nonce = reader.read_varint()?,
            (8, WIRE_VARINT) => block.difficulty = reader.read_varint()?,
            (_, wt) => reader.skip(wt)?,
        }
    }
    Ok(block)
}

/// Encodes a `CompressedUTXOMeshMessage`.
pub fn encode_mesh_message(msg: &MeshMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.payload.len() + 32);
    write_u32_field(&mut out, 1, u32::from(msg.kind.tag()));
    write_bytes_field(&mut out, 2, &msg.payload);
    write_u32_field(&mut out, 3, msg.timestamp);
    write_bytes_field(&mut out, 4, &msg.from_id);
    write_bytes_field(&mut out, 5, &msg.to_id);
    write_bytes_field(&mut out, 6, &msg.signature);
    out
}

/// Decodes a `CompressedUTXOMeshMessage`.
pub fn decode_mesh_message(data: &[u8]) -> Result<MeshMessage, WireError> {
    let mut reader = Reader::new(data);
    let mut kind = None;
    let mut msg = MeshMessage {
        kind: MessageKind::UtxoTransaction,
        payload: Vec::new(),
        timestamp: 0,
        from_id: Vec::new(),
        to_id: Vec::new(),
        signature: Vec::new(),
    };
    while !reader.done() {
        let (field, wire_type) = reader.read_key()?;
        match (field, wire_type) {
            (1, WIRE_VARINT) => {
                let tag = reader.read_varint()?;
                kind = Some(MessageKind::from_tag(
                    u8::try_from(tag).map_err(|_| WireError::UnknownMessageKind(0xff))?,
                )?);
            }
            (2, WIRE_LEN) => msg.payload = reader.read_bytes()?.to_vec(),
            (3, WIRE_VARINT) => msg.timestamp = reader.read_varint()?,
            (4, WIRE_LEN) => msg.from_id = reader.read_bytes()?.to_vec(),
            (5, WIRE_LEN) => msg.to_id = reader.read_bytes()?.to_vec(),
            (6, WIRE_LEN) => msg.signature = reader.read_bytes()?.to_vec(),
            (_, wt) => reader.skip(wt)?,
        }
    }
    msg.kind = kind.ok_or(WireError::UnknownMessageKind(0))?;
    Ok(msg)
}
