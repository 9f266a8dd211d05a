//! Connection-id registries (draft-27 §5.1).
//!
//! Tracks the ids we issued to the peer and the ids the peer issued to
//! us, with their sequence numbers and stateless-reset tokens (token
//! storage only; issuance of stateless resets is out of scope). Drives
//! NEW_CONNECTION_ID / RETIRE_CONNECTION_ID emission and retirement.

use rand::RngCore;

use crate::error::{Error, Result, TransportError};
use crate::frame;
use crate::packet::ConnectionId;

#[derive(Debug, Clone)]
struct CidEntry {
    seq: u64,
    cid: ConnectionId,
    reset_token: Option<[u8; 16]>,
}

pub(crate) struct CidManager {
    /// Ids we issued; seq 0 is the handshake source cid.
    local: Vec<CidEntry>,
    /// Ids the peer issued to us; seq 0 is its handshake source cid.
    remote: Vec<CidEntry>,
    next_local_seq: u64,
    /// How many of our ids the peer is willing to hold.
    peer_limit: u64,
    /// How many of the peer's ids we are willing to hold.
    local_limit: u64,
    cid_len: usize,
    /// NEW_CONNECTION_ID frames to (re)send, by local seq.
    issue_queue: Vec<u64>,
    /// RETIRE_CONNECTION_ID frames to (re)send, by remote seq.
    retire_queue: Vec<u64>,
}

impl CidManager {
    pub fn new(local_scid: ConnectionId, local_limit: u64, cid_len: usize) -> Self {
        Self {
            local: vec![CidEntry {
                seq: 0,
                cid: local_scid,
                reset_token: None,
            }],
            remote: Vec::new(),
            next_local_seq: 1,
            peer_limit: 1,
            local_limit,
            cid_len,
            issue_queue: Vec::new(),
            retire_queue: Vec::new(),
        }
    }

    /// The peer's active_connection_id_limit arrived; mint ids up to it.
    pub fn set_peer_limit(&mut self, limit: u64) {
        self.peer_limit = self.peer_limit.max(limit);
        while (self.local.len() as u64) < self.peer_limit {
            let seq = self.next_local_seq;
            self.next_local_seq += 1;
            let mut token = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut token);
            self.local.push(CidEntry {
                seq,
                cid: ConnectionId::random(self.cid_len),
                reset_token: Some(token),
            });
            self.issue_queue.push(seq);
        }
    }

    /// Record the peer's handshake source cid as its seq 0.
    pub fn set_initial_remote(&mut self, cid: ConnectionId) {
        if self.remote.is_empty() {
            self.remote.push(CidEntry {
                seq: 0,
                cid,
                reset_token: None,
            });
        }
    }

    /// Attach the reset token the peer's transport parameters carried to
    /// its handshake cid.
    pub fn set_initial_remote_token(&mut self, token: [u8; 16]) {
        if let Some(entry) = self.remote.iter_mut().find(|e| e.seq == 0) {
            entry.reset_token = Some(token);
        }
    }

    /// Does `cid` belong to us (routing check for short headers).
    pub fn is_local(&self, cid: &[u8]) -> bool {
        self.local.iter().any(|e| e.cid.as_bytes() == cid)
    }

    pub fn on_new_connection_id(
        &mut self,
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    ) -> Result<()> {
        if let Some(existing) = self.remote.iter().find(|e| e.seq == seq) {
            // Exact retransmission is fine; a contradiction is not.
            if existing.cid != cid {
                return Err(Error::for_frame(
                    TransportError::ProtocolViolation,
                    frame::TYPE_NEW_CONNECTION_ID,
                ));
            }
            return Ok(());
        }
        self.remote.push(CidEntry {
            seq,
            cid,
            reset_token: Some(reset_token),
        });

        // Retire everything below the peer's floor.
        let to_retire: Vec<u64> = self
            .remote
            .iter()
            .filter(|e| e.seq < retire_prior_to)
            .map(|e| e.seq)
            .collect();
        for seq in to_retire {
            self.remote.retain(|e| e.seq != seq);
            if !self.retire_queue.contains(&seq) {
                self.retire_queue.push(seq);
            }
        }

        if self.remote.len() as u64 > self.local_limit {
            return Err(Error::for_frame(
                TransportError::ProtocolViolation,
                frame::TYPE_NEW_CONNECTION_ID,
            ));
        }
        Ok(())
    }

    /// The peer retired one of our ids.
    pub fn on_retire_connection_id(&mut self, seq: u64, current_dcid: &[u8]) -> Result<()> {
        if seq >= self.next_local_seq {
            return Err(Error::for_frame(
                TransportError::ProtocolViolation,
                frame::TYPE_RETIRE_CONNECTION_ID,
            ));
        }
        // Retiring the id the frame itself arrived on is a violation.
        if self
            .local
            .iter()
            .any(|e| e.seq == seq && e.cid.as_bytes() == current_dcid)
        {
            return Err(Error::for_frame(
                TransportError::ProtocolViolation,
                frame::TYPE_RETIRE_CONNECTION_ID,
            ));
        }
        self.local.retain(|e| e.seq != seq);
        Ok(())
    }

    /// Next NEW_CONNECTION_ID to emit, if any.
    pub fn next_issue(&mut self) -> Option<(u64, ConnectionId, [u8; 16])> {
        let seq = *self.issue_queue.first()?;
        let entry = self.local.iter().find(|e| e.seq == seq)?;
        Some((seq, entry.cid.clone(), entry.reset_token.unwrap_or([0; 16])))
    }

    pub fn on_issue_sent(&mut self, seq: u64) {
        self.issue_queue.retain(|&s| s != seq);
    }

    pub fn on_issue_lost(&mut self, seq: u64) {
        if self.local.iter().any(|e| e.seq == seq) && !self.issue_queue.contains(&seq) {
            self.issue_queue.push(seq);
        }
    }

    /// Next RETIRE_CONNECTION_ID to emit, if any.
    pub fn next_retire(&mut self) -> Option<u64> {
        self.retire_queue.first().copied()
    }

    pub fn on_retire_sent(&mut self, seq: u64) {
        self.retire_queue.retain(|&s| s != seq);
    }

    pub fn on_retire_lost(&mut self, seq: u64) {
        if !self.retire_queue.contains(&seq) {
            self.retire_queue.push(seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CidManager {
        CidManager::new(ConnectionId::from_slice(&[1; 8]).unwrap(), 4, 8)
    }

    #[test]
    fn peer_limit_mints_ids() {
        let mut cids = manager();
        cids.set_peer_limit(3);
        let (seq, cid, _) = cids.next_issue().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(cid.len(), 8);
        cids.on_issue_sent(1);
        assert_eq!(cids.next_issue().unwrap().0, 2);
        cids.on_issue_sent(2);
        assert!(cids.next_issue().is_none());

        // A lost frame is queued again.
        cids.on_issue_lost(2);
        assert_eq!(cids.next_issue().unwrap().0, 2);
    }

    #[test]
    fn new_cid_with_retire_prior_to() {
        let mut cids = manager();
        cids.set_initial_remote(ConnectionId::from_slice(&[9; 8]).unwrap());
        cids.on_new_connection_id(1, 0, ConnectionId::from_slice(&[2; 8]).unwrap(), [0; 16])
            .unwrap();
        cids.on_new_connection_id(2, 2, ConnectionId::from_slice(&[3; 8]).unwrap(), [0; 16])
            .unwrap();
        // Seqs 0 and 1 are below the floor and owe RETIRE frames.
        assert_eq!(cids.next_retire(), Some(0));
        cids.on_retire_sent(0);
        assert_eq!(cids.next_retire(), Some(1));
    }

    #[test]
    fn contradictory_retransmission_rejected() {
        let mut cids = manager();
        cids.on_new_connection_id(1, 0, ConnectionId::from_slice(&[2; 8]).unwrap(), [0; 16])
            .unwrap();
        assert!(cids
            .on_new_connection_id(1, 0, ConnectionId::from_slice(&[4; 8]).unwrap(), [0; 16])
            .is_err());
        // Identical retransmission is accepted.
        assert!(cids
            .on_new_connection_id(1, 0, ConnectionId::from_slice(&[2; 8]).unwrap(), [0; 16])
            .is_ok());
    }

    #[test]
    fn retire_unknown_seq_rejected() {
        let mut cids = manager();
        assert!(cids.on_retire_connection_id(5, &[7; 8]).is_err());
        assert!(cids.on_retire_connection_id(0, &[7; 8]).is_ok());
    }

    #[test]
    fn retire_of_carrying_cid_rejected() {
        let mut cids = manager();
        assert!(cids.on_retire_connection_id(0, &[1; 8]).is_err());
    }
}
