// Copyright (c) Microsoft. All rights reserved.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use tss_esys::tcti::mock::Scripted;
use tss_esys::types::{alg, cc, rh, se, session_attr, Tpm2bMaxBuffer, TpmtSymDef};
use tss_esys::{base, EsysContext, EsysTr, Error, Layer, State, MAX_SUBMISSIONS, NO_SESSIONS};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn context() -> (EsysContext, Scripted) {
    init();
    let tpm = Scripted::new();
    (EsysContext::with_tcti(tpm.clone()), tpm)
}

fn esys(base: u32) -> Error {
    Error::new(Layer::Esapi, base)
}

/// A session-less response frame.
fn response(rc: u32, body: &[u8]) -> Vec<u8> {
    let mut out = 0x8001_u16.to_be_bytes().to_vec();
    out.extend_from_slice(&u32::try_from(10 + body.len()).unwrap().to_be_bytes());
    out.extend_from_slice(&rc.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// A response frame with one authorization.
fn session_response(parameters: &[u8], nonce: &[u8], attributes: u8, hmac: &[u8]) -> Vec<u8> {
    let mut body = u32::try_from(parameters.len()).unwrap().to_be_bytes().to_vec();
    body.extend_from_slice(parameters);
    body.extend_from_slice(&u16::try_from(nonce.len()).unwrap().to_be_bytes());
    body.extend_from_slice(nonce);
    body.push(attributes);
    body.extend_from_slice(&u16::try_from(hmac.len()).unwrap().to_be_bytes());
    body.extend_from_slice(hmac);

    let mut out = response(0, &body);
    out[..2].copy_from_slice(&0x8002_u16.to_be_bytes());
    out
}

fn random_bytes() -> Vec<u8> {
    response(0, &[0, 2, 0xC0, 0xDE])
}

fn start_session(ctx: &mut EsysContext, tpm: &Scripted, handle: u32) -> EsysTr {
    let mut body = handle.to_be_bytes().to_vec();
    body.extend_from_slice(&[0, 32]);
    body.extend_from_slice(&[0x5A; 32]);
    tpm.push_response(response(0, &body));

    ctx.start_auth_session(
        EsysTr::NONE,
        EsysTr::NONE,
        None,
        se::HMAC,
        TpmtSymDef::aes_cfb(128),
        alg::SHA256,
        NO_SESSIONS,
    )
    .unwrap()
}

#[test]
fn second_async_is_rejected_and_first_survives() {
    let (mut ctx, tpm) = context();

    ctx.get_random_async(2, NO_SESSIONS).unwrap();
    assert_eq!(ctx.state(), State::Sent);

    assert_eq!(
        ctx.get_random_async(2, NO_SESSIONS).unwrap_err(),
        esys(base::BAD_SEQUENCE)
    );
    assert_eq!(ctx.state(), State::Sent);
    assert_eq!(tpm.sent().len(), 1);

    // finishing a different command does not disturb the pending one
    assert_eq!(ctx.hash_finish().unwrap_err(), esys(base::BAD_SEQUENCE));
    assert_eq!(ctx.state(), State::Sent);

    tpm.push_response(random_bytes());
    let random = ctx.get_random_finish().unwrap();
    assert_eq!(random.as_bytes(), [0xC0, 0xDE]);
    assert_eq!(ctx.state(), State::Init);
}

#[test]
fn finish_without_async() {
    let (mut ctx, tpm) = context();
    assert_eq!(
        ctx.get_random_finish().unwrap_err(),
        esys(base::BAD_SEQUENCE)
    );
    assert_eq!(ctx.state(), State::Init);
    assert!(tpm.sent().is_empty());
}

#[test]
fn finish_before_response_is_try_again() {
    let (mut ctx, tpm) = context();
    ctx.set_timeout(tss_esys::Timeout::After(std::time::Duration::from_millis(0)));

    ctx.get_random_async(2, NO_SESSIONS).unwrap();
    assert!(ctx.get_random_finish().unwrap_err().is_try_again());
    assert_eq!(ctx.state(), State::Sent);

    tpm.push_response(random_bytes());
    ctx.get_random_finish().unwrap();
    assert_eq!(
        tpm.timeouts(),
        [tss_esys::Timeout::After(std::time::Duration::from_millis(0)); 2]
    );
}

#[test]
fn one_call_blocks_and_restores_timeout() {
    let (mut ctx, tpm) = context();
    let polling = tss_esys::Timeout::After(std::time::Duration::from_millis(5));
    ctx.set_timeout(polling);

    tpm.push_error(Error::new(Layer::Tcti, base::TRY_AGAIN));
    tpm.push_response(random_bytes());
    let random = ctx.get_random(2, NO_SESSIONS).unwrap();
    assert_eq!(random.as_bytes(), [0xC0, 0xDE]);
    assert_eq!(ctx.state(), State::Init);
    assert_eq!(tpm.timeouts(), [tss_esys::Timeout::Block; 2]);

    ctx.get_random_async(2, NO_SESSIONS).unwrap();
    tpm.push_response(random_bytes());
    ctx.get_random_finish().unwrap();
    assert_eq!(tpm.timeouts().last(), Some(&polling));
}

#[test]
fn yielded_command_is_resubmitted() {
    for yields in 0..MAX_SUBMISSIONS {
        let (mut ctx, tpm) = context();
        for _ in 0..yields {
            tpm.push_response(response(0x908, &[]));
        }
        tpm.push_response(random_bytes());

        ctx.get_random(2, NO_SESSIONS).unwrap();
        assert_eq!(ctx.submission_count(), yields + 1);
        assert_eq!(tpm.sent().len(), usize::try_from(yields + 1).unwrap());
        assert!(tpm.sent().windows(2).all(|w| w[0] == w[1]));
        assert_eq!(ctx.state(), State::Init);
    }
}

#[test]
fn resubmission_gives_up_at_ceiling() {
    let (mut ctx, tpm) = context();
    for _ in 0..MAX_SUBMISSIONS {
        tpm.push_response(response(0x908, &[]));
    }

    let err = ctx.get_random(2, NO_SESSIONS).unwrap_err();
    assert_eq!(err, Error::from_code(0x908));
    assert_eq!(ctx.submission_count(), MAX_SUBMISSIONS);
    assert_eq!(tpm.sent().len(), 5);
    assert_eq!(ctx.state(), State::Init);
}

#[test]
fn async_resubmission_reports_try_again() {
    let (mut ctx, tpm) = context();

    ctx.get_random_async(2, NO_SESSIONS).unwrap();
    tpm.push_response(response(0x922, &[]));
    assert_eq!(ctx.get_random_finish().unwrap_err(), esys(base::TRY_AGAIN));
    assert_eq!(ctx.state(), State::Sent);
    assert_eq!(ctx.submission_count(), 2);

    tpm.push_response(random_bytes());
    ctx.get_random_finish().unwrap();
    assert_eq!(ctx.state(), State::Init);
}

#[test]
fn tpm_error_returns_to_init() {
    let (mut ctx, tpm) = context();
    tpm.push_response(response(0x98E, &[]));

    let err = ctx.get_random(2, NO_SESSIONS).unwrap_err();
    assert_eq!(err.code(), 0x98E);
    assert_eq!(err.layer(), Layer::Tpm);
    assert_eq!(ctx.state(), State::Init);

    tpm.push_response(random_bytes());
    ctx.get_random(2, NO_SESSIONS).unwrap();
}

#[test]
fn transport_failure_needs_recovery() {
    let (mut ctx, tpm) = context();
    tpm.push_error(Error::new(Layer::Tcti, base::IO_ERROR));

    assert_eq!(
        ctx.get_random(2, NO_SESSIONS).unwrap_err(),
        Error::new(Layer::Tcti, base::IO_ERROR)
    );
    assert_eq!(ctx.state(), State::InternalError);
    assert_eq!(
        ctx.get_random_async(2, NO_SESSIONS).unwrap_err(),
        esys(base::BAD_SEQUENCE)
    );

    ctx.recover().unwrap();
    assert_eq!(ctx.state(), State::Init);
    tpm.push_response(random_bytes());
    ctx.get_random(2, NO_SESSIONS).unwrap();
}

#[test]
fn transmit_failure_leaves_internal_error() {
    let (mut ctx, tpm) = context();
    tpm.fail_next_transmit(Error::new(Layer::Tcti, base::IO_ERROR));

    assert!(ctx.get_random_async(2, NO_SESSIONS).is_err());
    assert_eq!(ctx.state(), State::InternalError);
    ctx.recover().unwrap();
    assert_eq!(ctx.state(), State::Init);
}

#[test]
fn unparseable_parameters_are_error_response() {
    let (mut ctx, tpm) = context();
    // claims four random bytes but carries two
    tpm.push_response(response(0, &[0, 4, 1, 2]));

    assert!(ctx.get_random(4, NO_SESSIONS).is_err());
    assert_eq!(ctx.state(), State::ErrorResponse);
    ctx.recover().unwrap();
}

#[test]
fn invalid_parameter_is_rejected_locally() {
    let (mut ctx, tpm) = context();
    let err = ctx
        .hash(Tpm2bMaxBuffer::default(), alg::SHA256, rh::LOCKOUT, NO_SESSIONS)
        .unwrap_err();
    assert_eq!(err, esys(base::BAD_VALUE));
    assert_eq!(ctx.state(), State::Init);
    assert!(tpm.sent().is_empty());
}

#[test]
fn two_decrypt_sessions_are_rejected() {
    let (mut ctx, tpm) = context();
    let s1 = start_session(&mut ctx, &tpm, 0x0200_0000);
    let s2 = start_session(&mut ctx, &tpm, 0x0200_0001);
    assert_ne!(s1, s2);

    for s in [s1, s2] {
        ctx.trsess_set_attributes(s, session_attr::DECRYPT, session_attr::DECRYPT)
            .unwrap();
        assert_eq!(
            ctx.trsess_get_attributes(s).unwrap(),
            session_attr::CONTINUE_SESSION | session_attr::DECRYPT
        );
    }

    let sent = tpm.sent().len();
    let err = ctx
        .hash(
            Tpm2bMaxBuffer::new(b"abc").unwrap(),
            alg::SHA256,
            rh::NULL,
            [s1, s2, EsysTr::NONE],
        )
        .unwrap_err();
    assert_eq!(err, esys(base::MULTIPLE_DECRYPT_SESSIONS));
    assert_eq!(ctx.state(), State::Init);
    assert_eq!(tpm.sent().len(), sent);
}

fn answer_get_random(tpm: &Scripted) {
    tpm.respond_with(|command| {
        // header, authorizationSize, session handle, then the caller nonce
        let nonce_caller = &command[20..52];
        let attributes = command[52];
        let parameters = [0, 4, 1, 2, 3, 4];
        let nonce_tpm = [0x77; 32];

        let rp_hash = Sha256::new()
            .chain_update(0_u32.to_be_bytes())
            .chain_update(cc::GET_RANDOM.to_be_bytes())
            .chain_update(parameters)
            .finalize();
        let mut mac = Hmac::<Sha256>::new_from_slice(b"").unwrap();
        mac.update(&rp_hash);
        mac.update(&nonce_tpm);
        mac.update(nonce_caller);
        mac.update(&[attributes]);
        let hmac = mac.finalize().into_bytes();

        Ok(session_response(&parameters, &nonce_tpm, attributes, &hmac))
    });
}

#[test]
fn hmac_session_round_trip() {
    let (mut ctx, tpm) = context();
    let session = start_session(&mut ctx, &tpm, 0x0200_0000);
    assert_eq!(ctx.trsess_get_nonce_tpm(session).unwrap().as_bytes(), [0x5A; 32]);

    answer_get_random(&tpm);
    let random = ctx
        .get_random(4, [session, EsysTr::NONE, EsysTr::NONE])
        .unwrap();
    assert_eq!(random.as_bytes(), [1, 2, 3, 4]);
    assert_eq!(ctx.trsess_get_nonce_tpm(session).unwrap().as_bytes(), [0x77; 32]);

    // the session is gone once it is used without continueSession
    ctx.trsess_set_attributes(session, 0, session_attr::CONTINUE_SESSION)
        .unwrap();
    ctx.get_random(4, [session, EsysTr::NONE, EsysTr::NONE])
        .unwrap();
    assert_eq!(
        ctx.trsess_get_attributes(session).unwrap_err(),
        esys(base::BAD_TR)
    );
}

#[test]
fn corrupted_response_hmac() {
    let (mut ctx, tpm) = context();
    let session = start_session(&mut ctx, &tpm, 0x0200_0000);
    let nonce_tpm = ctx.trsess_get_nonce_tpm(session).unwrap();

    tpm.push_response(session_response(
        &[0, 2, 9, 9],
        &[0x77; 32],
        session_attr::CONTINUE_SESSION,
        &[0; 32],
    ));
    let err = ctx
        .get_random(2, [session, EsysTr::NONE, EsysTr::NONE])
        .unwrap_err();
    assert_eq!(err, esys(base::RSP_AUTH_FAILED));
    assert_eq!(ctx.state(), State::InternalError);

    // the rejected response leaves the session's nonce alone
    ctx.recover().unwrap();
    assert_eq!(ctx.trsess_get_nonce_tpm(session).unwrap(), nonce_tpm);
}

#[test]
fn session_is_flushed() {
    let (mut ctx, tpm) = context();
    let session = start_session(&mut ctx, &tpm, 0x0200_0003);

    tpm.push_response(response(0, &[]));
    ctx.flush_context(session).unwrap();
    assert_eq!(&tpm.sent().last().unwrap()[10..], [0x02, 0, 0, 3]);
    assert_eq!(
        ctx.trsess_get_nonce_tpm(session).unwrap_err(),
        esys(base::BAD_TR)
    );
    assert_eq!(ctx.flush_context(session).unwrap_err(), esys(base::BAD_TR));
}

#[test]
fn failed_mint_releases_identifier() {
    let (mut ctx, tpm) = context();
    tpm.push_response(response(0x98E, &[]));
    assert!(ctx
        .start_auth_session(
            EsysTr::NONE,
            EsysTr::NONE,
            None,
            se::HMAC,
            TpmtSymDef::aes_cfb(128),
            alg::SHA256,
            NO_SESSIONS,
        )
        .is_err());

    assert_eq!(ctx.state(), State::Init);
    assert!(format!("{ctx:?}").contains("resources: 0"));

    let session = start_session(&mut ctx, &tpm, 0x0200_0000);
    assert!(ctx.trsess_get_attributes(session).is_ok());
    assert!(format!("{ctx:?}").contains("resources: 1"));
}
