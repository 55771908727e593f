//! UTXO-custom binary codec.
//!
//! A dense, self-contained packing of the transaction and block layouts.
//! Unlike the protobuf-lite codec it carries no field keys and no session
//! state: every field is written positionally, variable-length fields are
//! length-prefixed, and integers are LEB128 varints.

use crate::error::WireError;
use crate::types::{UtxoBlock, UtxoInput, UtxoOutput, UtxoTransaction};
use crate::varint;

const VERSION: u8 = 0x01;

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    varint::write_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let byte = *self.data.get(self.pos).ok_or(WireError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_varint(&mut self) -> Result<u32, WireError> {
        let (value, used) = varint::read_u32(&self.data[self.pos.min(self.data.len())..])?;
        self.pos += used;
        Ok(value)
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

    fn expect_end(&self) -> Result<(), WireError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(WireError::Truncated)
        }
    }
}

fn pack_transaction_body(out: &mut Vec<u8>, tx: &UtxoTransaction) {
    write_bytes(out, &tx.id);
    varint::write_u32(out, tx.inputs.len() as u32);
    for input in &tx.inputs {
        write_bytes(out, &input.tx_hash);
        varint::write_u32(out, input.output_index);
        write_bytes(out, &input.script_sig);
    }
    varint::write_u32(out, tx.outputs.len() as u32);
    for output in &tx.outputs {
        varint::write_u32(out, output.amount);
        write_bytes(out, output.address.as_bytes());
        write_bytes(out, &output.script_pubkey);
    }
    varint::write_u32(out, tx.fee);
    varint::write_u32(out, tx.timestamp);
    write_bytes(out, &tx.signature);
}

fn unpack_transaction_body(reader: &mut Reader<'_>) -> Result<UtxoTransaction, WireError> {
    let id = reader.read_bytes()?.to_vec();
    let n_inputs = reader.read_varint()?;
    let mut inputs = Vec::with_capacity(n_inputs.min(1024) as usize);
    for _ in 0..n_inputs {
        let tx_hash = reader.read_bytes()?.to_vec();
        let output_index = reader.read_varint()?;
        let script_sig = reader.read_bytes()?.to_vec();
        inputs.push(UtxoInput {
            tx_hash,
            output_index,
            script_sig,
        });
    }
    let n_outputs = reader.read_varint()?;
    let mut outputs = Vec::with_capacity(n_outputs.min(1024) as usize);
    for _ in 0..n_outputs {
        let amount = reader.read_varint()?;
        let address = String::from_utf8(reader.read_bytes()?.to_vec())
            .map_err(|_| WireError::Truncated)?;
        let script_pubkey = reader.read_bytes()?.to_vec();
        outputs.push(UtxoOutput {
            amount,
            address,
            script_pubkey,
        });
    }
    let fee = reader.read_varint()?;
    let timestamp = reader.read_varint()?;
    let signature = reader.read_bytes()?.to_vec();
    Ok(UtxoTransaction {
        id,
        inputs,
        outputs,
        fee,
        timestamp,
        signature,
    })
}

pub fn encode_transaction(tx: &UtxoTransaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(tx.estimated_size() + 2);
    out.push(VERSION);
    pack_transaction_body(&mut out, tx);
    out
}

pub fn decode_transaction(data: &[u8]) -> Result<UtxoTransaction, WireError> {
    let mut reader = Reader::new(data);
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(WireError::UnknownCodec(version));
    }
    let tx = unpack_transaction_body(&mut reader)?;
    reader.expect_end()?;
    Ok(tx)
}

pub fn encode_block(block: &UtxoBlock) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(VERSION);
    varint::write_u32(&mut out, block.index);
    varint::write_u32(&mut out, block.timestamp);
    varint::write_u32(&mut out, block.transactions.len() as u32);
    for tx in &block.transactions {
        pack_transaction_body(&mut out, tx);
    }
    write_bytes(&mut out, &block.previous_hash);
    write_bytes(&mut out, &block.hash);
    write_bytes(&mut out, &block.merkle_root);
    varint::write_u32(&mut out, block.nonce);
    varint::write_u32(&mut out, block.difficulty);
    out
}

pub fn decode_block(data: &[u8]) -> Result<UtxoBlock, WireError> {
    let mut reader = Reader::new(data);
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(WireError::UnknownCodec(version));
    }
    let index = reader.read_varint()?;
    let timestamp = reader.read_varint()?;
    let n_txs = reader.read_varint()?;
    let mut transactions = Vec::with_capacity(n_txs.min(1024) as usize);
    for _ in 0..n_txs {
        transactions.push(unpack_transaction_body(&mut reader)?);
    }
    let previous_hash = reader.read_bytes()?.to_vec();
    let hash = reader.read_bytes()?.to_vec();
    let merkle_root = reader.read_bytes()?.to_vec();
    let nonce = reader.read_varint()?;
    let difficulty = reader.read_varint()?;
    reader.expect_end()?;
    Ok(UtxoBlock {
        index,
        timestamp,
        transactions,
        previous_hash,
        hash,
        merkle_root,
        nonce,
        difficulty,
    })
}
