//! One-time key agreement that seeds a ratchet session.
//!
//! Initiator A with identity IK_A and fresh ephemeral EK_A, responder B with
//! identity IK_B, signed prekey SPK_B and optional one-time prekey OPK_B:
//!
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)   (only when a one-time prekey was handed out)
//!   SK  = KDF(DH1 || DH2 || DH3 [|| DH4], "courier-x3dh-v1")

use crate::prekeys::{verify_signed_prekey, PreKeyBundle};
use crate::utils::{dh, kdf, pubkey_from_hex};
use crate::{Result, SerializableKeyPair};
use nostr::PublicKey;

const X3DH_INFO: &[u8] = b"courier-x3dh-v1";

/// Result of initiating: the shared secret plus what the responder needs to
/// reproduce it.
pub struct Initiation {
    pub shared_secret: [u8; 32],
    pub ephemeral: SerializableKeyPair,
    pub their_identity: PublicKey,
    pub their_signed_prekey: PublicKey,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

pub fn initiate(our_identity: &SerializableKeyPair, bundle: &PreKeyBundle) -> Result<Initiation> {
    verify_signed_prekey(&bundle.identity_key, &bundle.signed_prekey)?;

    let their_identity = pubkey_from_hex(&bundle.identity_key)?;
    let their_signed_prekey = pubkey_from_hex(&bundle.signed_prekey.public_key)?;
    let one_time = bundle
        .one_time_prekey
        .as_ref()
        .map(|opk| Ok::<_, crate::Error>((opk.id, pubkey_from_hex(&opk.public_key)?)))
        .transpose()?;

    let ephemeral = SerializableKeyPair::generate();
    let ek = ephemeral.secret_key()?;

    let mut material = Vec::with_capacity(32 * 4);
    material.extend_from_slice(&dh(&our_identity.secret_key()?, &their_signed_prekey));
    material.extend_from_slice(&dh(&ek, &their_identity));
    material.extend_from_slice(&dh(&ek, &their_signed_prekey));
    if let Some((_, opk)) = &one_time {
        material.extend_from_slice(&dh(&ek, opk));
    }

    Ok(Initiation {
        shared_secret: kdf(&material, X3DH_INFO, 1)[0],
        ephemeral,
        their_identity,
        their_signed_prekey,
        signed_prekey_id: bundle.signed_prekey.id,
        one_time_prekey_id: one_time.map(|(id, _)| id),
    })
}

pub fn respond(
    our_identity: &SerializableKeyPair,
    our_signed_prekey: &SerializableKeyPair,
    our_one_time_prekey: Option<&SerializableKeyPair>,
    their_identity: &PublicKey,
    their_ephemeral: &PublicKey,
) -> Result<[u8; 32]> {
    let spk = our_signed_prekey.secret_key()?;

    let mut material = Vec::with_capacity(32 * 4);
    material.extend_from_slice(&dh(&spk, their_identity));
    material.extend_from_slice(&dh(&our_identity.secret_key()?, their_ephemeral));
    material.extend_from_slice(&dh(&spk, their_ephemeral));
    if let Some(opk) = our_one_time_prekey {
        material.extend_from_slice(&dh(&opk.secret_key()?, their_ephemeral));
    }

    Ok(kdf(&material, X3DH_INFO, 1)[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prekeys::{generate_prekeys, generate_signed_prekey};

    fn bundle_for(
        identity: &SerializableKeyPair,
        spk: &crate::prekeys::SignedPreKeyRecord,
        opk: Option<&crate::prekeys::PreKeyRecord>,
    ) -> PreKeyBundle {
        PreKeyBundle {
            user_id: "bob".to_string(),
            device_id: 1,
            registration_id: 7,
            identity_key: identity.public_hex(),
            signed_prekey: spk.public(),
            one_time_prekey: opk.map(|k| k.public()),
        }
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let alice = SerializableKeyPair::generate();
        let bob = SerializableKeyPair::generate();
        let spk = generate_signed_prekey(&bob, 1).unwrap();
        let opk = generate_prekeys(1, 1).remove(0);

        let init = initiate(&alice, &bundle_for(&bob, &spk, Some(&opk))).unwrap();
        let secret = respond(
            &bob,
            &spk.key_pair,
            Some(&opk.key_pair),
            &alice.public_key,
            &init.ephemeral.public_key,
        )
        .unwrap();

        assert_eq!(init.shared_secret, secret);
        assert_eq!(init.one_time_prekey_id, Some(1));
    }

    #[test]
    fn missing_one_time_prekey_changes_the_secret() {
        let alice = SerializableKeyPair::generate();
        let bob = SerializableKeyPair::generate();
        let spk = generate_signed_prekey(&bob, 1).unwrap();
        let opk = generate_prekeys(1, 1).remove(0);

        let init = initiate(&alice, &bundle_for(&bob, &spk, Some(&opk))).unwrap();
        let without_opk = respond(
            &bob,
            &spk.key_pair,
            None,
            &alice.public_key,
            &init.ephemeral.public_key,
        )
        .unwrap();

        assert_ne!(init.shared_secret, without_opk);
    }

    #[test]
    fn forged_bundle_is_refused() {
        let alice = SerializableKeyPair::generate();
        let bob = SerializableKeyPair::generate();
        let mallory = SerializableKeyPair::generate();
        let spk = generate_signed_prekey(&mallory, 1).unwrap();

        assert!(initiate(&alice, &bundle_for(&bob, &spk, None)).is_err());
    }
}
