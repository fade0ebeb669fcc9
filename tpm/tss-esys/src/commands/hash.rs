// Copyright (c) Microsoft. All rights reserved.

use crate::marshal::{Marshal, Unmarshal};
use crate::resource::ResourceTable;
use crate::types::{
    alg, cc, Tpm2bAuth, Tpm2bDigest, Tpm2bMaxBuffer, TpmAlgId, TpmCc, TpmHandle, TpmtTkHashcheck,
};
use crate::{EsysTr, Result};

use super::{check_hash_alg, check_hierarchy, Command, Minted};

#[derive(Clone, Debug)]
pub struct Hash {
    pub data: Tpm2bMaxBuffer,
    pub hash_alg: TpmAlgId,
    /// Hierarchy for the ticket. `rh::NULL` yields a null ticket.
    pub hierarchy: TpmHandle,
}

impl Command for Hash {
    const CODE: TpmCc = cc::HASH;
    const DECRYPT: bool = true;
    const ENCRYPT: bool = true;

    type Response = (Tpm2bDigest, TpmtTkHashcheck);
    type Output = (Tpm2bDigest, TpmtTkHashcheck);

    fn check_parameters(&self) -> Result<()> {
        check_hash_alg(self.hash_alg)?;
        check_hierarchy(self.hierarchy)
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.data)?;
        buf.marshal(&self.hash_alg)?;
        buf.marshal(&self.hierarchy)
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Self::Response> {
        Ok((buf.unmarshal()?, buf.unmarshal()?))
    }

    fn apply(
        &self,
        _: &mut ResourceTable,
        _: Option<Minted>,
        response: Self::Response,
    ) -> Result<Self::Output> {
        Ok(response)
    }
}

#[derive(Clone, Debug)]
pub struct HmacStart {
    pub handle: EsysTr,
    pub auth: Option<Tpm2bAuth>,
    /// `alg::NULL` selects the key's own scheme.
    pub hash_alg: TpmAlgId,
}

impl Command for HmacStart {
    const CODE: TpmCc = cc::HMAC_START;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;
    const DECRYPT: bool = true;
    const RESPONSE_HANDLE: bool = true;
    const MINTS: bool = true;

    type Response = ();
    type Output = EsysTr;

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.handle]
    }

    fn check_parameters(&self) -> Result<()> {
        if self.hash_alg == alg::NULL {
            return Ok(());
        }
        check_hash_alg(self.hash_alg)
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.auth)?;
        buf.marshal(&self.hash_alg)
    }

    fn unmarshal_response(_: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, resources: &mut ResourceTable, minted: Option<Minted>, (): ()) -> Result<EsysTr> {
        let (id, handle) = Minted::require(minted)?.response_handle()?;

        // Sequence objects have an empty name.
        let object = resources.get_mut(id)?;
        object.handle = handle;
        object.auth = self.auth.clone().unwrap_or_default();

        Ok(id)
    }
}

#[derive(Clone, Debug)]
pub struct SequenceUpdate {
    pub sequence_handle: EsysTr,
    pub buffer: Option<Tpm2bMaxBuffer>,
}

impl Command for SequenceUpdate {
    const CODE: TpmCc = cc::SEQUENCE_UPDATE;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;
    const DECRYPT: bool = true;

    type Response = ();
    type Output = ();

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.sequence_handle]
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.buffer)
    }

    fn unmarshal_response(_: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn apply(&self, _: &mut ResourceTable, _: Option<Minted>, (): ()) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SequenceComplete {
    pub sequence_handle: EsysTr,
    pub buffer: Option<Tpm2bMaxBuffer>,
    pub hierarchy: TpmHandle,
}

impl Command for SequenceComplete {
    const CODE: TpmCc = cc::SEQUENCE_COMPLETE;
    const AUTH_HANDLES: usize = 1;
    const MIN_SESSIONS: usize = 1;
    const DECRYPT: bool = true;
    const ENCRYPT: bool = true;

    type Response = (Tpm2bDigest, TpmtTkHashcheck);
    type Output = (Tpm2bDigest, TpmtTkHashcheck);

    fn handles(&self) -> Vec<EsysTr> {
        vec![self.sequence_handle]
    }

    fn check_parameters(&self) -> Result<()> {
        check_hierarchy(self.hierarchy)
    }

    fn marshal_parameters(&self, buf: &mut &mut [u8]) -> Result<()> {
        buf.marshal(&self.buffer)?;
        buf.marshal(&self.hierarchy)
    }

    fn unmarshal_response(buf: &mut &[u8]) -> Result<Self::Response> {
        Ok((buf.unmarshal()?, buf.unmarshal()?))
    }

    /// The TPM flushes the sequence object once it completes.
    fn apply(
        &self,
        resources: &mut ResourceTable,
        _: Option<Minted>,
        response: Self::Response,
    ) -> Result<Self::Output> {
        resources.delete(self.sequence_handle)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::{Hash, HmacStart, SequenceComplete};
    use crate::commands::{Command, Minted};
    use crate::resource::ResourceTable;
    use crate::types::{alg, rh, Tpm2bAuth, Tpm2bDigest, Tpm2bMaxBuffer, TpmtTk};
    use crate::EsysTr;

    #[test]
    fn hash_parameters() {
        let hash = Hash {
            data: Tpm2bMaxBuffer::new(b"abc").unwrap(),
            hash_alg: alg::SHA256,
            hierarchy: rh::OWNER,
        };
        hash.check_parameters().unwrap();

        let command = crate::sys::prepare(&hash, &[]).unwrap();
        assert_eq!(
            command[10..],
            [0, 3, b'a', b'b', b'c', 0x00, 0x0B, 0x40, 0x00, 0x00, 0x01]
        );

        let bad_alg = Hash {
            hash_alg: alg::AES,
            ..hash.clone()
        };
        assert!(bad_alg.check_parameters().is_err());

        let bad_hierarchy = Hash {
            hierarchy: 0x8000_0000,
            ..hash
        };
        assert!(bad_hierarchy.check_parameters().is_err());
    }

    #[test]
    fn sequence_lifecycle() {
        let mut resources = ResourceTable::default();
        let id = EsysTr(0x1000);
        resources.create(id).unwrap();

        let start = HmacStart {
            handle: EsysTr(0x0FFE),
            auth: Some(Tpm2bAuth::new(b"seq").unwrap()),
            hash_alg: alg::NULL,
        };
        start.check_parameters().unwrap();
        let seq = start
            .apply(
                &mut resources,
                Some(Minted {
                    id,
                    handle: Some(0x8000_0003),
                }),
                (),
            )
            .unwrap();

        let object = resources.get(seq).unwrap();
        assert!(object.name.is_empty());
        assert_eq!(object.auth.as_bytes(), b"seq");
        assert_eq!(object.handle, 0x8000_0003);

        SequenceComplete {
            sequence_handle: seq,
            buffer: None,
            hierarchy: rh::NULL,
        }
        .apply(
            &mut resources,
            None,
            (Tpm2bDigest::default(), TpmtTk::default()),
        )
        .unwrap();
        assert!(resources.get(seq).is_err());
    }
}
