//! Association handshake tests with a live SCP and SCU
//! on opposite ends of a local TCP connection.
use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use matches::matches;

use dicom_dimse::association::{
    ClientAssociationOptions, Error, ServerAssociationOptions,
};
use dicom_dimse::pdu::{
    AssociationRJServiceUserReason, AssociationRJSource, Pdu, PresentationContextNegotiated,
    PresentationContextResultReason,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

fn spawn_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        assert_eq!(association.client_ae_title(), SCU_AE_TITLE);
        assert_eq!(
            association.presentation_contexts(),
            &[
                PresentationContextNegotiated {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                    abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                },
                PresentationContextNegotiated {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                    abstract_syntax: DIGITAL_MG_STORAGE_SOP_CLASS.to_string(),
                }
            ],
        );

        // handle one release request; the release reply is automatic
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);

        Ok(())
    });
    Ok((h, addr))
}

/// Run an SCP and an SCU concurrently,
/// negotiate an association and release it.
#[test]
fn scu_scp_association_and_release() {
    let (scp_handle, scp_addr) = spawn_scp().unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .with_presentation_context(
            DIGITAL_MG_STORAGE_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE, JPEG_BASELINE],
        )
        .establish(scp_addr)
        .unwrap();

    // only the verification context was accepted
    assert_eq!(association.presentation_contexts().len(), 1);
    let pc = &association.presentation_contexts()[0];
    assert_eq!(pc.id, 1);
    assert_eq!(pc.transfer_syntax, IMPLICIT_VR_LE);
    assert_eq!(pc.abstract_syntax, VERIFICATION_SOP_CLASS);

    association
        .release()
        .expect("did not have a peaceful release");

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}

/// The transfer syntax preference order of the requester is honored.
#[test]
fn acceptor_honors_requester_transfer_syntax_order() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(
            VERIFICATION_SOP_CLASS,
            vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE],
        )
        .establish(addr)
        .unwrap();

    assert_eq!(
        association.presentation_contexts()[0].transfer_syntax,
        EXPLICIT_VR_LE
    );

    association.release().unwrap();
    h.join().unwrap().unwrap();
}

/// The SCP turns down requests for an AE title it does not answer to.
#[test]
fn association_rejected_on_unknown_called_ae_title() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let err = scp
            .establish(stream)
            .expect_err("establishment must fail at the SCP");
        assert!(matches!(err, Error::Rejected { .. }));
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("NOT-THIS-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .expect_err("establishment must fail at the SCU");

    match err {
        Error::Rejected { association_rj, .. } => {
            assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAeTitleNotRecognized
                )
            );
        }
        err => panic!("unexpected error {}", err),
    }

    h.join().unwrap();
}

/// A client abort surfaces as an error on the acceptor side.
#[test]
fn client_abort_reaches_the_scp() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        let err = association
            .receive()
            .expect_err("the peer abort must surface");
        assert!(matches!(err, Error::Aborted { .. }));
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();
    association.abort().unwrap();

    h.join().unwrap();
}

/// An idle association runs into the acceptor's timer
/// and is aborted rather than lingering.
#[test]
fn idle_association_times_out_and_aborts() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .read_timeout(Duration::from_millis(50));

    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        let err = association
            .receive()
            .expect_err("the read must time out");
        assert!(matches!(err, Error::Timeout { .. }));
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();

    // stay idle; the SCP gives up and sends an abort
    let err = association
        .receive()
        .expect_err("the abort must surface at the SCU");
    assert!(matches!(err, Error::Aborted { .. }));

    h.join().unwrap();
}
