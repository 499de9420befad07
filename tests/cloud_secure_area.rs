use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use holder_core::{
    core::util::AsyncHttpClient,
    csa::{
        crypto::{parse_public_key, public_key_bytes, verify},
        protocol::{Command, KeyPurpose, UserAuthType},
        CloudError, CloudSecureArea, CloudSecureAreaConfig, CloudSecureAreaServer,
        CloudServerConfig, KeyLockedReason, KeySettings, KeyUnlockData, PassphraseConstraints,
        PassphrasePrompt, Registration, SoftwareAttestationIssuer, SoftwareSecureHardware,
        BINDING_KEY_ALIAS, DEVICE_ATTESTATION_ALIAS,
    },
};
use http::{Request, Response, StatusCode};
use rand::rngs::OsRng;
use url::Url;

const PASSPHRASE: &str = "1234";

type Client = CloudSecureArea<Arc<CloudSecureAreaServer>, Arc<SoftwareSecureHardware>>;

struct Harness {
    server: Arc<CloudSecureAreaServer>,
    hardware: Arc<SoftwareSecureHardware>,
    csa: Client,
}

fn client_config() -> CloudSecureAreaConfig {
    CloudSecureAreaConfig::new(Url::parse("https://csa.example.com/").unwrap())
}

fn harness_with(server_config: CloudServerConfig, config: CloudSecureAreaConfig) -> Harness {
    let hardware = Arc::new(SoftwareSecureHardware::default());
    let server = Arc::new(CloudSecureAreaServer::new(
        server_config,
        SoftwareAttestationIssuer::generate(),
        Arc::new(hardware.issuer().authorizer()),
    ));
    let csa = CloudSecureArea::new(
        config,
        server.clone(),
        hardware.clone(),
        Arc::new(server.issuer().authorizer()),
    );
    Harness {
        server,
        hardware,
        csa,
    }
}

async fn registered_with(server_config: CloudServerConfig, config: CloudSecureAreaConfig) -> Harness {
    let mut harness = harness_with(server_config, config);
    harness.csa.register(PASSPHRASE).await.unwrap();
    harness
}

async fn registered() -> Harness {
    registered_with(CloudServerConfig::default(), client_config()).await
}

fn passphrase_settings() -> KeySettings {
    KeySettings::default().with_passphrase_required(true)
}

#[tokio::test]
async fn registration_establishes_a_session() {
    let Harness { hardware, csa, .. } = registered().await;

    let registration = csa.registration().unwrap();
    assert!(registration.keys.is_empty());
    assert!(hardware.contains_key(&registration.binding_key_alias));
    assert!(hardware.contains_key(&registration.device_attestation_id));
    // Session setup, then the stage 2 exchange.
    assert_eq!(csa.session_counters(), Some((2, 2)));
}

#[tokio::test]
async fn counters_advance_once_per_exchange() {
    let Harness { mut csa, .. } = registered().await;

    for _ in 0..3 {
        csa.check_passphrase(PASSPHRASE).await.unwrap();
    }

    assert_eq!(csa.session_counters(), Some((5, 5)));
}

#[tokio::test]
async fn untrusted_server_attestation_aborts_registration() {
    let hardware = Arc::new(SoftwareSecureHardware::default());
    let server = Arc::new(CloudSecureAreaServer::new(
        CloudServerConfig::default(),
        SoftwareAttestationIssuer::generate(),
        Arc::new(hardware.issuer().authorizer()),
    ));
    let stranger = SoftwareAttestationIssuer::generate();
    let mut csa = CloudSecureArea::new(
        client_config(),
        server,
        hardware.clone(),
        Arc::new(stranger.authorizer()),
    );

    let err = csa.register(PASSPHRASE).await.unwrap_err();

    assert!(matches!(err, CloudError::AttestationValidation(_)));
    assert!(!csa.is_registered());
    assert_eq!(csa.session_counters(), None);
    assert!(!hardware.contains_key(BINDING_KEY_ALIAS));
    assert!(!hardware.contains_key(DEVICE_ATTESTATION_ALIAS));
}

/// Forwards every request to the server after a fixed delay.
struct SlowServer(Arc<CloudSecureAreaServer>, Duration);

#[async_trait]
impl AsyncHttpClient for SlowServer {
    async fn execute(&self, request: Request<Vec<u8>>) -> anyhow::Result<Response<Vec<u8>>> {
        tokio::time::sleep(self.1).await;
        self.0.execute(request).await
    }
}

#[tokio::test(start_paused = true)]
async fn registration_is_bounded_by_the_operation_timeout() {
    let hardware = Arc::new(SoftwareSecureHardware::default());
    let server = Arc::new(CloudSecureAreaServer::new(
        CloudServerConfig::default(),
        SoftwareAttestationIssuer::generate(),
        Arc::new(hardware.issuer().authorizer()),
    ));
    let mut config = client_config();
    config.operation_timeout_ms = Some(500);
    let mut csa = CloudSecureArea::new(
        config,
        SlowServer(server.clone(), Duration::from_millis(200)),
        hardware.clone(),
        Arc::new(server.issuer().authorizer()),
    );

    let err = csa.register(PASSPHRASE).await.unwrap_err();

    assert!(matches!(err, CloudError::Timeout(d) if d == Duration::from_millis(500)));
    assert!(!csa.is_registered());
    assert_eq!(csa.session_counters(), None);
    assert!(!hardware.contains_key(BINDING_KEY_ALIAS));
    assert!(!hardware.contains_key(DEVICE_ATTESTATION_ALIAS));
}

#[tokio::test]
async fn passphrase_constraints_are_checked_before_registering() {
    let mut config = client_config();
    config.passphrase_constraints = PassphraseConstraints::pin(6);
    let mut harness = harness_with(CloudServerConfig::default(), config);

    let err = harness.csa.register("12345").await.unwrap_err();
    assert!(matches!(err, CloudError::InvalidPassphrase(_)));
    let err = harness.csa.register("12345a").await.unwrap_err();
    assert!(matches!(err, CloudError::InvalidPassphrase(_)));
    assert!(!harness.csa.is_registered());

    harness.csa.register("123456").await.unwrap();
    assert!(harness.csa.is_registered());
}

#[tokio::test]
async fn operations_require_registration() {
    let mut harness = harness_with(CloudServerConfig::default(), client_config());

    assert!(matches!(
        harness.csa.create_key("pid", &KeySettings::default()).await,
        Err(CloudError::NotRegistered)
    ));
    assert!(matches!(
        harness.csa.key_info("pid"),
        Err(CloudError::NotRegistered)
    ));
}

#[tokio::test]
async fn signatures_verify_against_the_attested_key() {
    let Harness { mut csa, .. } = registered().await;
    let metadata = csa.create_key("pid", &KeySettings::default()).await.unwrap();
    assert_eq!(metadata.algorithm(), "ES256");

    let data = b"presentation transcript";
    let signature = csa.sign("pid", data, KeyUnlockData::None).await.unwrap();

    assert!(verify(metadata.public_key(), data, &signature));
    assert!(!verify(metadata.public_key(), b"something else", &signature));
}

#[tokio::test]
async fn key_agreement_matches_local_ecdh() {
    let Harness { mut csa, .. } = registered().await;
    let metadata = csa
        .create_key("session", &KeySettings::new(vec![KeyPurpose::KeyAgreement]))
        .await
        .unwrap();
    assert_eq!(metadata.algorithm(), "ECDH-ES");

    let reader_key = p256::SecretKey::random(&mut OsRng);
    let zab = csa
        .key_agreement(
            "session",
            &public_key_bytes(&reader_key.public_key()),
            KeyUnlockData::None,
        )
        .await
        .unwrap();

    let remote = parse_public_key(metadata.public_key()).unwrap();
    let expected = p256::ecdh::diffie_hellman(reader_key.to_nonzero_scalar(), remote.as_affine());
    assert_eq!(zab, expected.raw_secret_bytes().to_vec());
}

#[tokio::test]
async fn keys_are_only_used_for_their_purpose() {
    let Harness { mut csa, .. } = registered().await;
    csa.create_key("pid", &KeySettings::default()).await.unwrap();
    let other = public_key_bytes(&p256::SecretKey::random(&mut OsRng).public_key());

    let err = csa
        .key_agreement("pid", &other, KeyUnlockData::None)
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::Protocol(_)));

    // The failed exchange dropped the session; the next one sets up anew.
    csa.sign("pid", b"data", KeyUnlockData::None).await.unwrap();
}

#[tokio::test]
async fn expired_keys_are_refused() {
    let Harness { mut csa, .. } = registered().await;
    csa.create_key("old", &KeySettings::default().with_validity(0, 1))
        .await
        .unwrap();

    let err = csa.sign("old", b"data", KeyUnlockData::None).await.unwrap_err();
    assert!(matches!(err, CloudError::Protocol(_)));
}

#[tokio::test]
async fn batch_creation_attests_every_key() {
    let Harness {
        mut csa, hardware, ..
    } = registered().await;

    let created = csa
        .batch_create_keys(&["a", "b", "c"], &KeySettings::default())
        .await
        .unwrap();

    assert_eq!(created.len(), 3);
    assert_ne!(created[0].public_key(), created[1].public_key());
    assert_ne!(created[1].public_key(), created[2].public_key());
    for metadata in &created {
        assert_eq!(csa.key_info(&metadata.alias).unwrap(), metadata);
        assert_eq!(metadata.attestation.certificate_chain.len(), 2);
        assert!(hardware.contains_key(&metadata.local_key_alias()));
        let signature = csa
            .sign(&metadata.alias, b"data", KeyUnlockData::None)
            .await
            .unwrap();
        assert!(verify(metadata.public_key(), b"data", &signature));
    }
}

#[tokio::test]
async fn deleted_keys_are_gone() {
    let Harness {
        mut csa, hardware, ..
    } = registered().await;
    let metadata = csa.create_key("pid", &KeySettings::default()).await.unwrap();

    csa.delete_key("pid").await.unwrap();

    assert!(matches!(csa.key_info("pid"), Err(CloudError::KeyNotFound(_))));
    assert!(!hardware.contains_key(&metadata.local_key_alias()));
    assert!(matches!(
        csa.sign("pid", b"data", KeyUnlockData::None).await,
        Err(CloudError::KeyNotFound(_))
    ));
    assert!(matches!(
        csa.delete_key("pid").await,
        Err(CloudError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn unregistering_removes_local_keys() {
    let Harness {
        mut csa, hardware, ..
    } = registered().await;
    let metadata = csa.create_key("pid", &KeySettings::default()).await.unwrap();
    let registration = csa.registration().unwrap().clone();

    csa.unregister().await.unwrap();

    assert!(!csa.is_registered());
    assert!(!hardware.contains_key(&metadata.local_key_alias()));
    assert!(!hardware.contains_key(&registration.binding_key_alias));
    assert!(!hardware.contains_key(&registration.device_attestation_id));
}

#[tokio::test]
async fn persisted_registration_resumes() {
    let Harness {
        server,
        hardware,
        mut csa,
    } = registered().await;
    let metadata = csa.create_key("pid", &passphrase_settings()).await.unwrap();

    let persisted = serde_json::to_string(csa.registration().unwrap()).unwrap();
    drop(csa);
    let registration: Registration = serde_json::from_str(&persisted).unwrap();

    let mut csa = CloudSecureArea::new(
        client_config(),
        server.clone(),
        hardware,
        Arc::new(server.issuer().authorizer()),
    )
    .with_registration(registration);
    assert_eq!(csa.session_counters(), None);

    let signature = csa
        .sign("pid", b"data", KeyUnlockData::Passphrase(PASSPHRASE.into()))
        .await
        .unwrap();
    assert!(verify(metadata.public_key(), b"data", &signature));
}

#[tokio::test]
async fn wrong_passphrase_locks_the_key() {
    let Harness { mut csa, .. } = registered().await;
    csa.create_key("pid", &passphrase_settings()).await.unwrap();

    let err = csa
        .sign("pid", b"data", KeyUnlockData::Passphrase("0000".into()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CloudError::KeyLocked(KeyLockedReason::WrongPassphrase)
    ));

    let err = csa
        .sign("pid", b"data", KeyUnlockData::None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CloudError::KeyLocked(KeyLockedReason::WrongPassphrase)
    ));

    csa.sign("pid", b"data", KeyUnlockData::Passphrase(PASSPHRASE.into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn check_passphrase_reports_wrong_passphrases() {
    let Harness { mut csa, .. } = registered().await;

    assert!(matches!(
        csa.check_passphrase("0000").await,
        Err(CloudError::KeyLocked(KeyLockedReason::WrongPassphrase))
    ));
    csa.check_passphrase(PASSPHRASE).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lockout_is_waited_out() {
    let server_config = CloudServerConfig {
        max_passphrase_attempts: 1,
        passphrase_lockout_ms: 2000,
    };
    let Harness { mut csa, .. } = registered_with(server_config, client_config()).await;
    csa.create_key("pid", &passphrase_settings()).await.unwrap();

    assert!(matches!(
        csa.sign("pid", b"data", KeyUnlockData::Passphrase("0000".into()))
            .await,
        Err(CloudError::KeyLocked(KeyLockedReason::WrongPassphrase))
    ));

    let started = tokio::time::Instant::now();
    csa.sign("pid", b"data", KeyUnlockData::Passphrase(PASSPHRASE.into()))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn lockout_check_reports_remaining_wait() {
    let server_config = CloudServerConfig {
        max_passphrase_attempts: 2,
        passphrase_lockout_ms: 5000,
    };
    let Harness { mut csa, .. } = registered_with(server_config, client_config()).await;

    for _ in 0..2 {
        assert!(csa.check_passphrase("0000").await.is_err());
    }
    tokio::time::advance(Duration::from_millis(1000)).await;

    let err = csa.check_passphrase(PASSPHRASE).await.unwrap_err();
    assert!(matches!(
        err,
        CloudError::KeyLocked(KeyLockedReason::TooManyAttempts { wait })
            if wait == Duration::from_millis(4000)
    ));
}

#[tokio::test(start_paused = true)]
async fn operation_timeout_cuts_back_off_short() {
    let server_config = CloudServerConfig {
        max_passphrase_attempts: 1,
        passphrase_lockout_ms: 2000,
    };
    let mut config = client_config();
    config.operation_timeout_ms = Some(500);
    let Harness { mut csa, .. } = registered_with(server_config, config).await;
    csa.create_key("pid", &passphrase_settings()).await.unwrap();
    assert!(csa
        .sign("pid", b"data", KeyUnlockData::Passphrase("0000".into()))
        .await
        .is_err());

    let err = csa
        .sign("pid", b"data", KeyUnlockData::Passphrase(PASSPHRASE.into()))
        .await
        .unwrap_err();

    assert!(matches!(err, CloudError::Timeout(d) if d == Duration::from_millis(500)));
    assert_eq!(csa.session_counters(), None);
}

/// Answers prompts from a script and records why each was shown.
struct ScriptedPrompt {
    answers: Mutex<VecDeque<Option<String>>>,
    reasons: Mutex<Vec<Option<KeyLockedReason>>>,
}

impl ScriptedPrompt {
    fn new(answers: &[Option<&str>]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.map(str::to_owned)).collect()),
            reasons: Mutex::new(Vec::new()),
        }
    }

    fn reasons(&self) -> Vec<Option<KeyLockedReason>> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl PassphrasePrompt for ScriptedPrompt {
    async fn request_passphrase(&self, reason: Option<KeyLockedReason>) -> Option<String> {
        self.reasons.lock().unwrap().push(reason);
        self.answers.lock().unwrap().pop_front().flatten()
    }
}

#[tokio::test]
async fn interactive_unlock_prompts_again_after_a_wrong_passphrase() {
    let Harness { mut csa, .. } = registered().await;
    csa.create_key("pid", &passphrase_settings()).await.unwrap();
    let prompt = ScriptedPrompt::new(&[Some("0000"), Some(PASSPHRASE)]);

    csa.sign("pid", b"data", KeyUnlockData::Interactive(&prompt))
        .await
        .unwrap();

    assert_eq!(
        prompt.reasons(),
        vec![None, Some(KeyLockedReason::WrongPassphrase)]
    );
}

#[tokio::test]
async fn interactive_unlock_can_be_canceled() {
    let Harness { mut csa, .. } = registered().await;
    csa.create_key("pid", &passphrase_settings()).await.unwrap();
    let prompt = ScriptedPrompt::new(&[Some("0000"), None]);

    let err = csa
        .sign("pid", b"data", KeyUnlockData::Interactive(&prompt))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CloudError::KeyLocked(KeyLockedReason::UserCanceled)
    ));
    assert_eq!(prompt.reasons().len(), 2);
}

#[tokio::test]
async fn interactive_unlock_skips_the_prompt_without_passphrase() {
    let Harness { mut csa, .. } = registered().await;
    csa.create_key("pid", &KeySettings::default()).await.unwrap();
    let prompt = ScriptedPrompt::new(&[]);

    csa.sign("pid", b"data", KeyUnlockData::Interactive(&prompt))
        .await
        .unwrap();

    assert!(prompt.reasons().is_empty());
}

#[tokio::test]
async fn companion_key_requires_user_authentication() {
    let Harness {
        mut csa, hardware, ..
    } = registered().await;
    csa.create_key(
        "pid",
        &KeySettings::default().with_user_authentication(vec![UserAuthType::Biometric]),
    )
    .await
    .unwrap();

    hardware.set_user_authenticated(false);
    let err = csa
        .sign("pid", b"data", KeyUnlockData::None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CloudError::KeyLocked(KeyLockedReason::UserNotAuthenticated)
    ));

    hardware.set_user_authenticated(true);
    csa.sign("pid", b"data", KeyUnlockData::None).await.unwrap();
}

#[tokio::test]
async fn expired_session_is_rekeyed_transparently() {
    let Harness {
        server, mut csa, ..
    } = registered().await;
    csa.check_passphrase(PASSPHRASE).await.unwrap();
    assert_eq!(csa.session_counters(), Some((3, 3)));

    server.expire_sessions();
    csa.check_passphrase(PASSPHRASE).await.unwrap();

    assert_eq!(csa.session_counters(), Some((2, 2)));
}

/// Forwards session setup to the server and rejects every wrapped request
/// as undecryptable.
struct RejectWrapped(Arc<CloudSecureAreaServer>);

#[async_trait]
impl AsyncHttpClient for RejectWrapped {
    async fn execute(&self, request: Request<Vec<u8>>) -> anyhow::Result<Response<Vec<u8>>> {
        if let Command::E2eeRequest(_) = Command::decode(request.body())? {
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(b"unable to decrypt request".to_vec())?);
        }
        self.0.execute(request).await
    }
}

#[tokio::test]
async fn rekeying_gives_up_after_the_configured_attempts() {
    let Harness {
        server, hardware, csa,
    } = registered().await;
    let registration = csa.registration().unwrap().clone();

    let mut csa = CloudSecureArea::new(
        client_config(),
        RejectWrapped(server.clone()),
        hardware,
        Arc::new(server.issuer().authorizer()),
    )
    .with_registration(registration);

    let err = csa.check_passphrase(PASSPHRASE).await.unwrap_err();
    assert!(matches!(err, CloudError::RekeyLimitExceeded(10)));
    assert_eq!(csa.session_counters(), None);
}
