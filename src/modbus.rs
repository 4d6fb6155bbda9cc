use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// The most registers a single Modbus read may ask for.
pub const MAX_READ_COUNT: u16 = 125;

/// Exception code devices and gateways send back while they are busy with another request.
pub const SERVER_BUSY: u8 = 6;

/// Length of the MBAP header up to and including the length field.
const HEADER_LENGTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleRegister { address: u16, value: u16 },
}

impl Operation {
    pub const fn function_code(&self) -> u8 {
        match self {
            Operation::ReadHoldingRegisters { .. } => 3,
            Operation::ReadInputRegisters { .. } => 4,
            Operation::WriteSingleRegister { .. } => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::Registers { .. } | ResponseKind::WriteSingle { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(SERVER_BUSY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    Registers { values: Vec<u16> },
    WriteSingle { address: u16, value: u16 },
}

/// Modbus TCP framing: an MBAP header followed by the PDU.
///
/// Register addresses are sent as given, with no offset applied.
pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (first, second) = match req.operation {
            Operation::ReadHoldingRegisters { address, count }
            | Operation::ReadInputRegisters { address, count } => (address, count),
            Operation::WriteSingleRegister { address, value } => (address, value),
        };
        dst.reserve(HEADER_LENGTH + 6);
        dst.put_u16(req.transaction_id);
        dst.put_u16(0);
        // Unit identifier, function code and four bytes of arguments.
        dst.put_u16(6);
        dst.put_u8(req.device_id);
        dst.put_u8(req.operation.function_code());
        dst.put_u16(first);
        dst.put_u16(second);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

fn invalid_data(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some(header) = src.first_chunk::<HEADER_LENGTH>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let protocol = u16::from_be_bytes([header[2], header[3]]);
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if protocol != 0 || length < 2 {
                // Not a frame boundary, resynchronize byte by byte.
                src.advance(1);
                continue;
            }
            let Some(data) = src.get(HEADER_LENGTH..HEADER_LENGTH + length) else {
                src.reserve(HEADER_LENGTH + length - src.len());
                return Ok(None);
            };
            let device_id = data[0];
            let function_code = data[1];
            let kind = match (function_code, &data[2..]) {
                (0x80..=0xff, [code, ..]) => Ok(Some(ResponseKind::ErrorCode(*code))),
                (3 | 4, [byte_count, payload @ ..]) => {
                    let byte_count = usize::from(*byte_count).min(payload.len());
                    let values = payload[..byte_count]
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect();
                    Ok(Some(ResponseKind::Registers { values }))
                }
                (6, [a, b, c, d, ..]) => Ok(Some(ResponseKind::WriteSingle {
                    address: u16::from_be_bytes([*a, *b]),
                    value: u16::from_be_bytes([*c, *d]),
                })),
                (3 | 4 | 6, _) => Err(invalid_data(format!(
                    "truncated response to function {function_code} (transaction {transaction_id})"
                ))),
                _ => Ok(None),
            };
            src.advance(HEADER_LENGTH + length);
            match kind? {
                Some(kind) => return Ok(Some(Response { device_id, transaction_id, kind })),
                None => {
                    debug!(message = "skipping response with unknown function code", function_code);
                    continue;
                }
            }
        }
    }
}
