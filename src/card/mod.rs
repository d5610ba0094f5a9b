//! Card operating system core
//!
//! Owns the file tree, the SAM and the active personality, and runs
//! the command cycle: class-byte decode, secure-messaging unwrap,
//! instruction dispatch through a fixed table, response wrap and
//! response chaining.

pub mod atr;
pub mod storage;

use log::{debug, warn};

use crate::apdu::{ins, parse_apdu, Apdu, Response, SmMode, SW};
use crate::error::{CardResult, SwError};
use crate::fs::FileTree;
use crate::personality::Personality;
use crate::se::SecureAccessModule;

/// File-system operations of the instruction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Select,
    ReadBinary { odd: bool },
    WriteBinary { odd: bool },
    UpdateBinary { odd: bool },
    EraseBinary { odd: bool },
    SearchBinary { odd: bool },
    ReadRecord { odd: bool },
    WriteRecord,
    UpdateRecord { odd: bool },
    AppendRecord,
    EraseRecord,
    GetData { odd: bool },
    PutData { odd: bool },
    CreateFile,
    DeleteFile,
}

/// SAM operations of the instruction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamOp {
    Verify,
    ManageSecurityEnvironment,
    ChangeReferenceData,
    PerformSecurityOperation,
    GenerateKeyPair,
    ExternalAuthenticate,
    GetChallenge,
    InternalAuthenticate,
}

/// One entry of the instruction table, tagged with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Fs(FsOp),
    Sam(SamOp),
    GetResponse,
}

/// The fixed instruction table.
pub fn lookup_instruction(instruction: u8) -> Option<Operation> {
    use Operation::{Fs, Sam};
    match instruction {
        ins::ERASE_RECORD => Some(Fs(FsOp::EraseRecord)),
        ins::ERASE_BINARY => Some(Fs(FsOp::EraseBinary { odd: false })),
        ins::ERASE_BINARY_ODD => Some(Fs(FsOp::EraseBinary { odd: true })),
        ins::VERIFY => Some(Sam(SamOp::Verify)),
        ins::MANAGE_SECURITY_ENVIRONMENT => Some(Sam(SamOp::ManageSecurityEnvironment)),
        ins::CHANGE_REFERENCE_DATA => Some(Sam(SamOp::ChangeReferenceData)),
        ins::PERFORM_SECURITY_OPERATION => Some(Sam(SamOp::PerformSecurityOperation)),
        ins::GENERATE_KEY_PAIR => Some(Sam(SamOp::GenerateKeyPair)),
        ins::EXTERNAL_AUTHENTICATE => Some(Sam(SamOp::ExternalAuthenticate)),
        ins::GET_CHALLENGE => Some(Sam(SamOp::GetChallenge)),
        ins::INTERNAL_AUTHENTICATE => Some(Sam(SamOp::InternalAuthenticate)),
        ins::SEARCH_BINARY => Some(Fs(FsOp::SearchBinary { odd: false })),
        ins::SEARCH_BINARY_ODD => Some(Fs(FsOp::SearchBinary { odd: true })),
        ins::SELECT_FILE => Some(Fs(FsOp::Select)),
        ins::READ_BINARY => Some(Fs(FsOp::ReadBinary { odd: false })),
        ins::READ_BINARY_ODD => Some(Fs(FsOp::ReadBinary { odd: true })),
        ins::READ_RECORD => Some(Fs(FsOp::ReadRecord { odd: false })),
        ins::READ_RECORD_ODD => Some(Fs(FsOp::ReadRecord { odd: true })),
        ins::GET_RESPONSE => Some(Operation::GetResponse),
        ins::GET_DATA => Some(Fs(FsOp::GetData { odd: false })),
        ins::GET_DATA_ODD => Some(Fs(FsOp::GetData { odd: true })),
        ins::WRITE_BINARY => Some(Fs(FsOp::WriteBinary { odd: false })),
        ins::WRITE_BINARY_ODD => Some(Fs(FsOp::WriteBinary { odd: true })),
        ins::WRITE_RECORD => Some(Fs(FsOp::WriteRecord)),
        ins::UPDATE_BINARY => Some(Fs(FsOp::UpdateBinary { odd: false })),
        ins::UPDATE_BINARY_ODD => Some(Fs(FsOp::UpdateBinary { odd: true })),
        ins::PUT_DATA => Some(Fs(FsOp::PutData { odd: false })),
        ins::PUT_DATA_ODD => Some(Fs(FsOp::PutData { odd: true })),
        ins::UPDATE_RECORD => Some(Fs(FsOp::UpdateRecord { odd: false })),
        ins::UPDATE_RECORD_ODD => Some(Fs(FsOp::UpdateRecord { odd: true })),
        ins::CREATE_FILE => Some(Fs(FsOp::CreateFile)),
        ins::APPEND_RECORD => Some(Fs(FsOp::AppendRecord)),
        ins::DELETE_FILE => Some(Fs(FsOp::DeleteFile)),
        _ => None,
    }
}

/// Family-specific maximum response length when Le is absent or zero.
const DEFAULT_LE: usize = 256;

/// The card operating system for one virtual card.
pub struct CardOs {
    pub fs: FileTree,
    pub sam: SecureAccessModule,
    pub personality: Personality,
    /// Remainder of a truncated response, served by GET RESPONSE.
    pending_response: Vec<u8>,
    /// Status word the buffered remainder completes with.
    pending_sw: u16,
    /// Accumulated body of a chained command.
    chaining_buffer: Vec<u8>,
    chaining_ins: Option<u8>,
}

impl CardOs {
    pub fn new(personality: Personality) -> Self {
        let mut card = Self {
            fs: FileTree::new(),
            sam: SecureAccessModule::new(Vec::new(), Vec::new(), Vec::new()),
            personality,
            pending_response: Vec::new(),
            pending_sw: SW::SUCCESS,
            chaining_buffer: Vec::new(),
            chaining_ins: None,
        };
        card.personality.seed(&mut card.fs, &mut card.sam);
        card
    }

    /// Build a card around previously personalized state.
    pub fn with_state(personality: Personality, fs: FileTree, sam: SecureAccessModule) -> Self {
        Self {
            fs,
            sam,
            personality,
            pending_response: Vec::new(),
            pending_sw: SW::SUCCESS,
            chaining_buffer: Vec::new(),
            chaining_ins: None,
        }
    }

    /// The personality's answer to reset.
    pub fn atr(&self) -> Vec<u8> {
        self.personality.atr.clone()
    }

    /// Reset session state, as on power-up or a reset control frame.
    pub fn reset(&mut self) {
        debug!("card reset");
        self.sam.reset_session();
        let mf = self.fs.mf();
        self.fs.set_current(mf);
        self.pending_response.clear();
        self.pending_sw = SW::SUCCESS;
        self.chaining_buffer.clear();
        self.chaining_ins = None;
        self.personality.reset_session();
    }

    /// Process one command APDU to completion.
    pub fn process_apdu(&mut self, raw: &[u8]) -> Response {
        let apdu = match parse_apdu(raw) {
            Ok(apdu) => apdu,
            Err(err) => {
                warn!("unparseable APDU: {err}");
                return Response::error(SW::WRONG_LENGTH);
            }
        };
        let class = apdu.class();
        debug!(
            "command ins {:#04x} p1 {:#04x} p2 {:#04x} lc {} sm {:?}",
            apdu.ins,
            apdu.p1,
            apdu.p2,
            apdu.data.len(),
            class.sm
        );

        // GET RESPONSE drains the chaining buffer before anything else.
        if apdu.ins == ins::GET_RESPONSE {
            return match self.get_response(&apdu) {
                Ok(response) => response,
                Err(err) => err.into(),
            };
        }

        // Command chaining accumulates body parts until the final part.
        if class.chaining {
            return self.accumulate_chain(&apdu);
        }
        let apdu = match self.finish_chain(apdu) {
            Ok(apdu) => apdu,
            Err(err) => return err.into(),
        };

        let sm_active = class.sm.is_active() && class.sm != SmMode::Proprietary;
        let plain = if sm_active {
            match self.sam.current_se.unwrap_command(&apdu) {
                Ok(plain) => plain,
                Err(err) => {
                    debug!("secure messaging unwrap failed: {err}");
                    return err.into();
                }
            }
        } else {
            apdu
        };

        let result = self.dispatch(&plain);
        let mut response = match result {
            Ok(data) => Response::success(data),
            Err(err) => {
                debug!("command failed: {err}");
                return err.into();
            }
        };

        if sm_active {
            response = match self.sam.current_se.wrap_response(&response) {
                Ok(wrapped) => wrapped,
                Err(err) => return err.into(),
            };
        }

        self.chain_response(response, plain.le)
    }

    /// Route a plain command to its operation. The personality
    /// extension is consulted first.
    fn dispatch(&mut self, apdu: &Apdu) -> CardResult<Vec<u8>> {
        if let Some(extension) = self.personality.extension.as_mut() {
            if extension.handles(apdu) {
                return extension.dispatch(apdu, &mut self.fs, &mut self.sam);
            }
        }
        let operation = lookup_instruction(apdu.ins)
            .ok_or_else(SwError::instruction_not_supported)?;
        let (p1, p2, data) = (apdu.p1, apdu.p2, apdu.data.as_slice());
        match operation {
            Operation::Fs(op) => match op {
                FsOp::Select => self.fs.cmd_select(p1, p2, data),
                FsOp::ReadBinary { odd } => self.fs.cmd_read_binary(odd, p1, p2, data),
                FsOp::WriteBinary { odd } => self.fs.cmd_write_binary(odd, p1, p2, data),
                FsOp::UpdateBinary { odd } => self.fs.cmd_update_binary(odd, p1, p2, data),
                FsOp::EraseBinary { odd } => self.fs.cmd_erase_binary(odd, p1, p2, data),
                FsOp::SearchBinary { odd } => self.fs.cmd_search_binary(odd, p1, p2, data),
                FsOp::ReadRecord { odd } => self.fs.cmd_read_record(odd, p1, p2, data),
                FsOp::WriteRecord => self.fs.cmd_write_record(p1, p2, data),
                FsOp::UpdateRecord { odd } => self.fs.cmd_update_record(odd, p1, p2, data),
                FsOp::AppendRecord => self.fs.cmd_append_record(p1, p2, data),
                FsOp::EraseRecord => self.fs.cmd_erase_record(p1, p2),
                FsOp::GetData { odd } => self.fs.cmd_get_data(odd, p1, p2, data),
                FsOp::PutData { odd } => self.fs.cmd_put_data(odd, p1, p2, data),
                FsOp::CreateFile => self.fs.cmd_create_file(data),
                FsOp::DeleteFile => self.fs.cmd_delete_file(data),
            },
            Operation::Sam(op) => match op {
                SamOp::Verify => self.sam.cmd_verify(p1, p2, data),
                SamOp::ManageSecurityEnvironment => {
                    self.sam.cmd_manage_security_environment(p1, p2, data)
                }
                SamOp::ChangeReferenceData => {
                    self.sam.cmd_change_reference_data(p1, p2, data)
                }
                SamOp::PerformSecurityOperation => {
                    self.sam.cmd_perform_security_operation(p1, p2, data)
                }
                SamOp::GenerateKeyPair => self.sam.cmd_generate_keypair(p1, p2),
                SamOp::ExternalAuthenticate => {
                    self.sam.cmd_external_authenticate(p1, p2, data, &mut self.fs)
                }
                SamOp::GetChallenge => self.sam.cmd_get_challenge(apdu.le),
                SamOp::InternalAuthenticate => {
                    self.sam.cmd_internal_authenticate(p1, p2, data, &mut self.fs)
                }
            },
            Operation::GetResponse => Err(SwError::conditions_not_satisfied()),
        }
    }

    fn accumulate_chain(&mut self, apdu: &Apdu) -> Response {
        if let Some(chained) = self.chaining_ins {
            if chained != apdu.ins {
                self.chaining_buffer.clear();
                self.chaining_ins = None;
                return Response::error(SW::CONDITIONS_NOT_SATISFIED);
            }
        } else {
            self.chaining_ins = Some(apdu.ins);
            self.chaining_buffer.clear();
        }
        self.chaining_buffer.extend_from_slice(&apdu.data);
        Response::ok()
    }

    fn finish_chain(&mut self, apdu: Apdu) -> CardResult<Apdu> {
        if self.chaining_buffer.is_empty() {
            return Ok(apdu);
        }
        if self.chaining_ins != Some(apdu.ins) {
            self.chaining_buffer.clear();
            self.chaining_ins = None;
            return Err(SwError::conditions_not_satisfied());
        }
        let mut data = std::mem::take(&mut self.chaining_buffer);
        data.extend_from_slice(&apdu.data);
        self.chaining_ins = None;
        Ok(Apdu { data, ..apdu })
    }

    /// Truncate to the requested length, buffering any remainder for
    /// GET RESPONSE and signalling it through 0x61XX.
    fn chain_response(&mut self, response: Response, le: Option<u32>) -> Response {
        let limit = le.map(|le| le as usize).unwrap_or(DEFAULT_LE);
        if response.data.len() <= limit {
            return response;
        }
        let head = response.data[..limit].to_vec();
        self.pending_response = response.data[limit..].to_vec();
        self.pending_sw = response.sw;
        let remaining = self.pending_response.len().min(0xFF) as u8;
        Response::more_data(head, remaining)
    }

    fn get_response(&mut self, apdu: &Apdu) -> CardResult<Response> {
        if apdu.p1 != 0x00 || apdu.p2 != 0x00 {
            return Err(SwError::incorrect_p1p2());
        }
        if self.pending_response.is_empty() {
            return Err(SwError::conditions_not_satisfied());
        }
        let limit = apdu.le.map(|le| le as usize).unwrap_or(DEFAULT_LE);
        let take = limit.min(self.pending_response.len());
        let head: Vec<u8> = self.pending_response.drain(..take).collect();
        if self.pending_response.is_empty() {
            // Remainder fully drained: original status.
            Ok(Response::new(head, self.pending_sw))
        } else {
            let remaining = self.pending_response.len().min(0xFF) as u8;
            Ok(Response::more_data(head, remaining))
        }
    }
}
