use std::sync::{Arc, Mutex, MutexGuard};

use emissary_core::prompt::{PinEntry, PinEntryLauncher, PromptError};
use emissary_core::{AddedKey, Agent, AgentError, Key, Signature};
use tracing::{debug, info, warn};

use crate::card::{Card, CardError, PinType, Slot, Transaction};
use crate::pubkey::{PivPublicKey, RsaHash, SignatureError};

impl From<CardError> for AgentError {
    fn from(e: CardError) -> Self {
        AgentError::Device(e.to_string())
    }
}

impl From<SignatureError> for AgentError {
    fn from(e: SignatureError) -> Self {
        AgentError::Verification(e.to_string())
    }
}

#[derive(Debug, Clone)]
struct KnownKey {
    fingerprint: Vec<u8>,
    slot: Slot,
    public_key: PivPublicKey,
}

struct CardState {
    card: Box<dyn Card>,
    known_keys: Vec<KnownKey>,
}

/// Exposes the certificates on one PIV smartcard as signing keys.
///
/// All card access is serialized by one lock, held for a whole operation
/// including any PIN prompt.
pub struct PivAgent {
    state: Arc<Mutex<CardState>>,
    pin_entry: Arc<dyn PinEntryLauncher>,
}

impl std::fmt::Debug for PivAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PivAgent").finish_non_exhaustive()
    }
}

impl PivAgent {
    pub fn new(card: Box<dyn Card>, pin_entry: Arc<dyn PinEntryLauncher>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CardState {
                card,
                known_keys: Vec::new(),
            })),
            pin_entry,
        }
    }

    /// Run `f` on the blocking pool with the card lock held.
    async fn with_card<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&mut CardState) -> Result<T, AgentError> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_state(&state)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| AgentError::Device(format!("card task failed: {e}")))?
    }
}

fn lock_state(state: &Mutex<CardState>) -> Result<MutexGuard<'_, CardState>, AgentError> {
    state
        .lock()
        .map_err(|_| AgentError::Device("card lock poisoned".into()))
}

fn list_slots(state: &mut CardState) -> Result<Vec<Key>, AgentError> {
    // A failed listing leaves nothing signable.
    state.known_keys.clear();
    let mut tx = Transaction::begin(state.card.as_mut())?;

    let mut keys = Vec::new();
    let mut known = Vec::new();
    for slot in Slot::LISTED {
        let cert = match tx.certificate(slot) {
            Ok(cert) => cert,
            Err(e) => {
                debug!(slot = %slot, error = %e, "no usable certificate");
                continue;
            }
        };
        let public_key = match PivPublicKey::from_spki_der(&cert.public_key_der) {
            Ok(key) => key,
            Err(e) => {
                warn!(slot = %slot, error = %e, "skipping {} key", slot.name());
                continue;
            }
        };
        let (format, blob) = match public_key.ssh_encoding() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(slot = %slot, error = %e, "could not encode {} key", slot.name());
                continue;
            }
        };

        known.push(KnownKey {
            fingerprint: blob.clone(),
            slot,
            public_key,
        });
        keys.push(Key::new(format, blob, cert.subject));
    }
    drop(tx);

    state.known_keys = known;
    Ok(keys)
}

/// A PIN entry session launched on first use and shut down when dropped.
struct PinSession<'a> {
    launcher: &'a dyn PinEntryLauncher,
    session: Option<Box<dyn PinEntry>>,
}

impl<'a> PinSession<'a> {
    fn new(launcher: &'a dyn PinEntryLauncher) -> Self {
        Self {
            launcher,
            session: None,
        }
    }

    fn get(&mut self) -> Result<&mut (dyn PinEntry + 'static), PromptError> {
        if self.session.is_none() {
            self.session = Some(self.launcher.launch()?);
        }
        self.session
            .as_deref_mut()
            .ok_or_else(|| PromptError::Protocol("PIN entry session unavailable".into()))
    }
}

impl Drop for PinSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_mut()
            && let Err(e) = session.shutdown()
        {
            debug!(error = %e, "PIN entry shutdown failed");
        }
    }
}

fn login(card: &mut dyn Card, pins: &mut PinSession<'_>, slot: Slot) -> Result<(), AgentError> {
    let prompt = pins.get()?;
    prompt.set_description(&format!("Authenticating with {} key", slot.name()))?;
    prompt.set_prompt("PIN:")?;

    loop {
        let pin = prompt.get_pin()?;
        match card.login(PinType::Application, pin.as_bytes()) {
            Ok(()) => {
                debug!(slot = %slot, "card login succeeded");
                return Ok(());
            }
            Err(e) if e.pin_attempts() > 0 => {
                warn!(slot = %slot, attempts = e.pin_attempts(), "wrong PIN");
                prompt.set_repeat_prompt(&format!("{} attempts remaining", e.pin_attempts()))?;
            }
            Err(e) => return Err(AgentError::from(e).context("logging in")),
        }
    }
}

fn sign_with_slot(
    state: &mut CardState,
    launcher: &dyn PinEntryLauncher,
    fingerprint: &[u8],
    data: &[u8],
    hash: RsaHash,
) -> Result<Signature, AgentError> {
    let Some(known) = state
        .known_keys
        .iter()
        .find(|k| k.fingerprint == fingerprint)
        .cloned()
    else {
        return Err(AgentError::NotFound);
    };

    let mut tx = Transaction::begin(state.card.as_mut())?;
    let input = known.public_key.card_input(data, hash);
    let algorithm = known.public_key.algorithm();
    let mut pins = PinSession::new(launcher);

    loop {
        match tx.sign(known.slot, algorithm, &input) {
            Ok(raw) => {
                let sig = known.public_key.verify(data, &raw, hash)?;
                debug!(slot = %known.slot, "signed with card");
                return Ok(Signature {
                    format: sig.algorithm().as_str().to_string(),
                    blob: sig.as_bytes().to_vec(),
                });
            }
            Err(e) if e.is_login_required() => login(&mut *tx, &mut pins, known.slot)?,
            Err(e) => return Err(AgentError::from(e).context("signing")),
        }
    }
}

#[async_trait::async_trait]
impl Agent for PivAgent {
    fn kind(&self) -> &str {
        "piv"
    }

    async fn list(&self) -> Result<Vec<Key>, AgentError> {
        let keys = self.with_card(list_slots).await?;
        info!(count = keys.len(), "listed PIV keys");
        Ok(keys)
    }

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Signature, AgentError> {
        self.sign_with_flags(key, data, 0).await
    }

    async fn sign_with_flags(
        &self,
        key: &Key,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, AgentError> {
        let launcher = Arc::clone(&self.pin_entry);
        let fingerprint = key.fingerprint().to_vec();
        let data = data.to_vec();
        let hash = RsaHash::from_flags(flags);
        self.with_card(move |state| {
            sign_with_slot(state, launcher.as_ref(), &fingerprint, &data, hash)
        })
        .await
    }

    async fn add(&self, _key: &AddedKey) -> Result<(), AgentError> {
        Err(AgentError::unsupported("cannot add keys to a smartcard"))
    }

    async fn remove(&self, _key: &Key) -> Result<(), AgentError> {
        Err(AgentError::unsupported("cannot remove keys from a smartcard"))
    }

    async fn remove_all(&self) -> Result<(), AgentError> {
        Err(AgentError::unsupported("cannot remove keys from a smartcard"))
    }

    async fn lock(&self, _passphrase: &[u8]) -> Result<(), AgentError> {
        self.with_card(|state| {
            let mut tx = Transaction::begin(state.card.as_mut())?;
            tx.logout()?;
            Ok(())
        })
        .await
    }

    async fn unlock(&self, _passphrase: &[u8]) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{Algorithm, SlotCertificate};
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::signature::Verifier;
    use p256::pkcs8::EncodePublicKey;
    use rand::rngs::OsRng;
    use rsa::Pkcs1v15Sign;
    use sha2::{Digest, Sha256, Sha512};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use zeroize::Zeroizing;

    const PIN: &str = "123456";

    #[derive(Default)]
    struct CardLog {
        events: Vec<String>,
        logged_in: bool,
        attempts: u8,
    }

    /// A card holding software P-256 or RSA keys that may demand a PIN
    /// before signing.
    struct FakeCard {
        keys: HashMap<Slot, SigningKey>,
        rsa_keys: HashMap<Slot, rsa::RsaPrivateKey>,
        certs: HashMap<Slot, SlotCertificate>,
        require_login: bool,
        /// Sign with this key instead of the slot's.
        wrong_signer: Option<SigningKey>,
        blocked: bool,
        /// Shared so a test can pull the card out after construction.
        removed: Arc<AtomicBool>,
        log: Arc<Mutex<CardLog>>,
    }

    impl FakeCard {
        fn new(log: Arc<Mutex<CardLog>>) -> Self {
            log.lock().unwrap().attempts = 3;
            Self {
                keys: HashMap::new(),
                rsa_keys: HashMap::new(),
                certs: HashMap::new(),
                require_login: false,
                wrong_signer: None,
                blocked: false,
                removed: Arc::new(AtomicBool::new(false)),
                log,
            }
        }

        fn with_key(mut self, slot: Slot, subject: &str) -> (Self, SigningKey) {
            let key = SigningKey::random(&mut OsRng);
            let der = key.verifying_key().to_public_key_der().unwrap();
            self.certs.insert(
                slot,
                SlotCertificate {
                    subject: subject.to_string(),
                    public_key_der: der.as_bytes().to_vec(),
                },
            );
            self.keys.insert(slot, key.clone());
            (self, key)
        }

        fn with_rsa_key(mut self, slot: Slot, subject: &str) -> (Self, rsa::RsaPrivateKey) {
            let key = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
            let der = key.to_public_key().to_public_key_der().unwrap();
            self.certs.insert(
                slot,
                SlotCertificate {
                    subject: subject.to_string(),
                    public_key_der: der.as_bytes().to_vec(),
                },
            );
            self.rsa_keys.insert(slot, key.clone());
            (self, key)
        }

        fn event(&self, event: impl Into<String>) {
            self.log.lock().unwrap().events.push(event.into());
        }
    }

    impl Card for FakeCard {
        fn begin_transaction(&mut self) -> Result<(), CardError> {
            if self.removed.load(Ordering::SeqCst) {
                return Err(CardError::Transport("no card present".into()));
            }
            self.event("begin");
            Ok(())
        }

        fn end_transaction(&mut self) {
            self.event("end");
        }

        fn select_app(&mut self) -> Result<(), CardError> {
            self.event("select");
            Ok(())
        }

        fn certificate(&mut self, slot: Slot) -> Result<SlotCertificate, CardError> {
            self.certs
                .get(&slot)
                .cloned()
                .ok_or(CardError::NoCertificate(slot))
        }

        fn login(&mut self, _pin_type: PinType, pin: &[u8]) -> Result<(), CardError> {
            self.event(format!("login:{}", String::from_utf8_lossy(pin)));
            let mut log = self.log.lock().unwrap();
            if self.blocked {
                return Err(CardError::PinBlocked);
            }
            if pin == PIN.as_bytes() {
                log.logged_in = true;
                log.attempts = 3;
                Ok(())
            } else {
                log.attempts -= 1;
                Err(CardError::WrongPin {
                    attempts: log.attempts,
                })
            }
        }

        fn logout(&mut self) -> Result<(), CardError> {
            self.event("logout");
            self.log.lock().unwrap().logged_in = false;
            Ok(())
        }

        fn sign(
            &mut self,
            slot: Slot,
            algorithm: Algorithm,
            input: &[u8],
        ) -> Result<Vec<u8>, CardError> {
            self.event(format!("sign:{slot}"));
            if self.require_login && !self.log.lock().unwrap().logged_in {
                return Err(CardError::LoginRequired);
            }
            match algorithm {
                Algorithm::EccP256 => {
                    let key = self
                        .wrong_signer
                        .as_ref()
                        .or_else(|| self.keys.get(&slot))
                        .ok_or(CardError::NoCertificate(slot))?;
                    let sig: p256::ecdsa::Signature = key
                        .sign_prehash(input)
                        .map_err(|e| CardError::Other(e.to_string()))?;
                    Ok(sig.to_der().as_bytes().to_vec())
                }
                Algorithm::Rsa1024 => {
                    let key = self.rsa_keys.get(&slot).ok_or(CardError::NoCertificate(slot))?;
                    assert_eq!(input.len(), 128);
                    // Recover the digest from the padded block and sign it
                    // again with the matching scheme.
                    let (scheme, hashed) = [
                        Pkcs1v15Sign::new::<Sha256>(),
                        Pkcs1v15Sign::new::<Sha512>(),
                    ]
                    .into_iter()
                    .find_map(|scheme| {
                        let hash_len = scheme.hash_len.unwrap();
                        let info = &input[input.len() - hash_len - scheme.prefix.len()..];
                        info.starts_with(&scheme.prefix)
                            .then(|| (scheme, info[info.len() - hash_len..].to_vec()))
                    })
                    .ok_or_else(|| CardError::Other("bad padding".into()))?;
                    key.sign(scheme, &hashed)
                        .map_err(|e| CardError::Other(e.to_string()))
                }
                other => panic!("unexpected algorithm {other:?}"),
            }
        }
    }

    #[derive(Default)]
    struct PromptLog {
        events: Vec<String>,
        pins: VecDeque<Result<String, ()>>,
    }

    #[derive(Clone, Default)]
    struct FakePinEntry(Arc<Mutex<PromptLog>>);

    impl FakePinEntry {
        fn with_pins(pins: &[&str]) -> Self {
            let entry = Self::default();
            entry.0.lock().unwrap().pins = pins.iter().map(|p| Ok(p.to_string())).collect();
            entry
        }

        fn cancelling() -> Self {
            let entry = Self::default();
            entry.0.lock().unwrap().pins.push_back(Err(()));
            entry
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().events.clone()
        }

        fn push(&self, event: String) {
            self.0.lock().unwrap().events.push(event);
        }
    }

    impl PinEntryLauncher for FakePinEntry {
        fn launch(&self) -> Result<Box<dyn PinEntry>, PromptError> {
            self.push("launch".into());
            Ok(Box::new(self.clone()))
        }
    }

    impl PinEntry for FakePinEntry {
        fn set_description(&mut self, text: &str) -> Result<(), PromptError> {
            self.push(format!("desc:{text}"));
            Ok(())
        }

        fn set_prompt(&mut self, text: &str) -> Result<(), PromptError> {
            self.push(format!("prompt:{text}"));
            Ok(())
        }

        fn set_repeat_prompt(&mut self, text: &str) -> Result<(), PromptError> {
            self.push(format!("repeat:{text}"));
            Ok(())
        }

        fn get_pin(&mut self) -> Result<Zeroizing<String>, PromptError> {
            self.push("getpin".into());
            match self.0.lock().unwrap().pins.pop_front() {
                Some(Ok(pin)) => Ok(Zeroizing::new(pin)),
                _ => Err(PromptError::Cancelled),
            }
        }

        fn shutdown(&mut self) -> Result<(), PromptError> {
            self.push("shutdown".into());
            Ok(())
        }
    }

    fn card_events(log: &Arc<Mutex<CardLog>>) -> Vec<String> {
        log.lock().unwrap().events.clone()
    }

    #[tokio::test]
    async fn list_reads_both_slots_and_skips_empty_ones() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (card, _) = FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=alice");
        let agent = PivAgent::new(Box::new(card), Arc::new(FakePinEntry::default()));

        let keys = agent.list().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].format, "ecdsa-sha2-nistp256");
        assert_eq!(keys[0].comment, "CN=alice");
        assert_eq!(card_events(&log), ["begin", "select", "end"]);
    }

    #[tokio::test]
    async fn malformed_certificate_is_skipped() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (mut card, _) = FakeCard::new(log).with_key(Slot::CardAuthentication, "CN=card");
        card.certs.insert(
            Slot::Authentication,
            SlotCertificate {
                subject: "CN=broken".into(),
                public_key_der: vec![0x30, 0x00],
            },
        );
        let agent = PivAgent::new(Box::new(card), Arc::new(FakePinEntry::default()));

        let keys = agent.list().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment, "CN=card");
    }

    #[tokio::test]
    async fn sign_before_list_is_not_found() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (card, key) = FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=a");
        let agent = PivAgent::new(Box::new(card), Arc::new(FakePinEntry::default()));

        let piv_key = PivPublicKey::P256(*key.verifying_key());
        let (format, blob) = piv_key.ssh_encoding().unwrap();
        let err = agent
            .sign(&Key::new(format, blob, ""), b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound));
        assert!(card_events(&log).is_empty());
    }

    #[tokio::test]
    async fn login_retry_prompts_once_per_attempt_and_verifies() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (mut card, signing) =
            FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=alice");
        card.require_login = true;
        let pins = FakePinEntry::with_pins(&["000000", PIN]);
        let agent = PivAgent::new(Box::new(card), Arc::new(pins.clone()));

        let keys = agent.list().await.unwrap();
        let sig = agent.sign(&keys[0], b"challenge").await.unwrap();

        assert_eq!(
            pins.events(),
            [
                "launch",
                "desc:Authenticating with PIV Authentication key",
                "prompt:PIN:",
                "getpin",
                "repeat:2 attempts remaining",
                "getpin",
                "shutdown",
            ]
        );
        assert_eq!(
            card_events(&log),
            [
                "begin", "select", "end", // list
                "begin", "select", "sign:9a", "login:000000", "login:123456", "sign:9a", "end",
            ]
        );

        assert_eq!(sig.format, "ecdsa-sha2-nistp256");
        let ssh_sig = ssh_key::Signature::new(
            ssh_key::Algorithm::new(&sig.format).unwrap(),
            sig.blob.clone(),
        )
        .unwrap();
        let p256_sig = p256::ecdsa::Signature::try_from(&ssh_sig).unwrap();
        signing.verifying_key().verify(b"challenge", &p256_sig).unwrap();
    }

    #[tokio::test]
    async fn no_prompt_when_card_is_already_unlocked() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (card, _) = FakeCard::new(log).with_key(Slot::Authentication, "CN=a");
        let pins = FakePinEntry::default();
        let agent = PivAgent::new(Box::new(card), Arc::new(pins.clone()));

        let keys = agent.list().await.unwrap();
        agent.sign(&keys[0], b"data").await.unwrap();
        assert!(pins.events().is_empty());
    }

    #[tokio::test]
    async fn signature_from_the_wrong_key_is_rejected() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (mut card, _) = FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=a");
        card.wrong_signer = Some(SigningKey::random(&mut OsRng));
        let agent = PivAgent::new(Box::new(card), Arc::new(FakePinEntry::default()));

        let keys = agent.list().await.unwrap();
        let err = agent.sign(&keys[0], b"data").await.unwrap_err();
        assert!(matches!(err, AgentError::Verification(_)));
        assert_eq!(card_events(&log).last().map(String::as_str), Some("end"));
    }

    #[tokio::test]
    async fn blocked_pin_is_fatal_and_shuts_the_prompt_down() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (mut card, _) = FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=a");
        card.require_login = true;
        card.blocked = true;
        let pins = FakePinEntry::with_pins(&[PIN]);
        let agent = PivAgent::new(Box::new(card), Arc::new(pins.clone()));

        let keys = agent.list().await.unwrap();
        let err = agent.sign(&keys[0], b"data").await.unwrap_err();
        assert!(err.to_string().contains("PIN is blocked"));
        assert_eq!(pins.events().last().map(String::as_str), Some("shutdown"));
        assert_eq!(card_events(&log).last().map(String::as_str), Some("end"));
    }

    #[tokio::test]
    async fn cancelled_pin_entry_ends_the_transaction() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (mut card, _) = FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=a");
        card.require_login = true;
        let pins = FakePinEntry::cancelling();
        let agent = PivAgent::new(Box::new(card), Arc::new(pins.clone()));

        let keys = agent.list().await.unwrap();
        let err = agent.sign(&keys[0], b"data").await.unwrap_err();
        assert!(matches!(err, AgentError::Prompt(PromptError::Cancelled)));
        assert_eq!(pins.events().last().map(String::as_str), Some("shutdown"));
        assert_eq!(card_events(&log).last().map(String::as_str), Some("end"));
    }

    #[tokio::test]
    async fn lock_logs_out_and_mutation_is_refused() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (card, _) = FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=a");
        let agent = PivAgent::new(Box::new(card), Arc::new(FakePinEntry::default()));

        agent.lock(b"").await.unwrap();
        assert_eq!(card_events(&log), ["begin", "select", "logout", "end"]);
        agent.unlock(b"").await.unwrap();

        let keys = agent.list().await.unwrap();
        assert!(matches!(agent.remove(&keys[0]).await, Err(AgentError::Unsupported(_))));
        assert!(matches!(agent.remove_all().await, Err(AgentError::Unsupported(_))));
        let added = AddedKey {
            private_key: emissary_core::SecretBytes::new(Vec::new()),
            comment: String::new(),
        };
        assert!(matches!(agent.add(&added).await, Err(AgentError::Unsupported(_))));
    }

    #[tokio::test]
    async fn rsa_slot_signs_with_the_requested_hash() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (card, private) =
            FakeCard::new(log.clone()).with_rsa_key(Slot::Authentication, "CN=rsa");
        let agent = PivAgent::new(Box::new(card), Arc::new(FakePinEntry::default()));

        let keys = agent.list().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].format, "ssh-rsa");

        let public = private.to_public_key();
        let sig = agent
            .sign_with_flags(&keys[0], b"challenge", emissary_core::SIGN_FLAG_RSA_SHA2_512)
            .await
            .unwrap();
        assert_eq!(sig.format, "rsa-sha2-512");
        public
            .verify(
                Pkcs1v15Sign::new::<Sha512>(),
                &Sha512::digest(b"challenge"),
                &sig.blob,
            )
            .unwrap();

        let sig = agent.sign(&keys[0], b"challenge").await.unwrap();
        assert_eq!(sig.format, "rsa-sha2-256");
        public
            .verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &Sha256::digest(b"challenge"),
                &sig.blob,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn failed_list_forgets_previously_listed_keys() {
        let log = Arc::new(Mutex::new(CardLog::default()));
        let (card, _) = FakeCard::new(log.clone()).with_key(Slot::Authentication, "CN=a");
        let removed = Arc::clone(&card.removed);
        let agent = PivAgent::new(Box::new(card), Arc::new(FakePinEntry::default()));

        let keys = agent.list().await.unwrap();
        assert_eq!(keys.len(), 1);

        removed.store(true, Ordering::SeqCst);
        assert!(matches!(agent.list().await, Err(AgentError::Device(_))));

        removed.store(false, Ordering::SeqCst);
        let err = agent.sign(&keys[0], b"data").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound));
        assert!(!card_events(&log).iter().any(|e| e.starts_with("sign:")));
    }
}
