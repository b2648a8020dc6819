//! Loopback DNS responder
//!
//! Answers A/AAAA queries for proxied domains with loopback addresses so
//! the client's TLS connection lands on the intercept listener, and
//! relays every other query to the cleartext upstream untouched.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::proto::op::{Message, MessageType, ResponseCode};
use hickory_resolver::proto::rr::rdata::{A, AAAA};
use hickory_resolver::proto::rr::{RData, Record, RecordType};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::policy::PolicyStore;

/// EDNS0 allows datagrams past the classic 512-byte limit.
const DNS_BUF_SIZE: usize = 4096;
/// TTL handed to clients on synthesized loopback answers.
const LOOPBACK_TTL: u32 = 60;
/// How long to wait on the cleartext upstream before dropping a query.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP DNS server bound to the loopback resolver address.
pub struct DnsResponder {
    socket: Arc<UdpSocket>,
    policy: Arc<PolicyStore>,
    upstream: SocketAddr,
}

impl DnsResponder {
    /// Binds the responder socket. Bind failure is a startup failure.
    pub async fn bind(
        addr: SocketAddr,
        upstream: SocketAddr,
        policy: Arc<PolicyStore>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("DNS responder listening on {}", addr);
        Ok(Self {
            socket: Arc::new(socket),
            policy,
            upstream,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams forever, one spawned task per query.
    pub async fn run(self) -> std::io::Result<()> {
        let mut buf = [0u8; DNS_BUF_SIZE];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let packet = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let policy = Arc::clone(&self.policy);
            let upstream = self.upstream;
            tokio::spawn(async move {
                if let Err(e) = handle_query(socket, policy, upstream, packet, peer).await {
                    warn!("DNS exchange with {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_query(
    socket: Arc<UdpSocket>,
    policy: Arc<PolicyStore>,
    upstream: SocketAddr,
    packet: Vec<u8>,
    peer: SocketAddr,
) -> std::io::Result<()> {
    let message = match Message::from_vec(&packet) {
        Ok(message) => message,
        Err(e) => {
            warn!("undecodable DNS packet from {}: {}", peer, e);
            return Ok(());
        }
    };

    if let Some(reply) = classify(&policy, &message) {
        match reply.to_vec() {
            Ok(bytes) => {
                socket.send_to(&bytes, peer).await?;
            }
            Err(e) => error!("failed to encode DNS reply: {}", e),
        }
        return Ok(());
    }

    // Relay the raw datagram so the upstream answer reaches the client
    // byte for byte. No reply on failure; the client retries on its own
    // schedule.
    if let Some(response) = forward(upstream, &packet).await? {
        socket.send_to(&response, peer).await?;
    }
    Ok(())
}

/// Builds an immediate reply for queries we answer ourselves: malformed
/// multi-question messages get FORMERR, A/AAAA questions for proxied
/// domains get an authoritative loopback answer. Returns `None` when the
/// query should be forwarded instead.
fn classify(policy: &PolicyStore, message: &Message) -> Option<Message> {
    if message.queries().len() > 1 {
        // never seen from real stub resolvers
        warn!("refusing {}-question query", message.queries().len());
        return Some(form_err(message));
    }
    let query = message.queries().first()?;

    let qtype = query.query_type();
    if qtype != RecordType::A && qtype != RecordType::AAAA {
        return None;
    }

    let name = query.name().to_string();
    if !policy.is_proxied(name.trim_end_matches('.')) {
        return None;
    }
    debug!("answering {} {} with loopback", qtype, name);

    let rdata = match qtype {
        RecordType::A => RData::A(A(Ipv4Addr::LOCALHOST)),
        _ => RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
    };

    let mut reply = reply_to(message);
    reply.set_authoritative(true);
    reply.add_answer(Record::from_rdata(query.name().clone(), LOOPBACK_TTL, rdata));
    Some(reply)
}

/// Response skeleton mirroring the request header and question section.
fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(request.recursion_desired());
    for query in request.queries() {
        reply.add_query(query.clone());
    }
    reply
}

fn form_err(request: &Message) -> Message {
    let mut reply = reply_to(request);
    reply.set_response_code(ResponseCode::FormErr);
    reply
}

/// One ephemeral socket per exchange; the upstream response comes back
/// unmodified.
async fn forward(upstream: SocketAddr, packet: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
    let bind_addr: SocketAddr = if upstream.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(packet, upstream).await?;

    let mut buf = [0u8; DNS_BUF_SIZE];
    match tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Ok(Some(buf[..len].to_vec())),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!("upstream {} timed out", upstream);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::proto::op::Query;
    use hickory_resolver::proto::rr::Name;
    use std::str::FromStr;

    fn policy() -> PolicyStore {
        PolicyStore::with_domains(["example.com".to_string()].into_iter().collect())
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut message = Message::new();
        message.set_id(4242);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        message
    }

    /// An in-policy A query gets exactly one authoritative 127.0.0.1
    /// answer with TTL 60 and the question echoed back.
    #[test]
    fn proxied_a_query_gets_loopback() {
        let request = query("www.example.com.", RecordType::A);
        let reply = classify(&policy(), &request).unwrap();

        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert!(reply.authoritative());
        assert!(reply.recursion_desired());
        assert_eq!(reply.queries(), request.queries());

        assert_eq!(reply.answers().len(), 1);
        let answer = &reply.answers()[0];
        assert_eq!(answer.ttl(), LOOPBACK_TTL);
        assert_eq!(answer.data(), Some(&RData::A(A(Ipv4Addr::LOCALHOST))));
    }

    #[test]
    fn proxied_aaaa_query_gets_loopback() {
        let request = query("www.example.com.", RecordType::AAAA);
        let reply = classify(&policy(), &request).unwrap();

        let answer = &reply.answers()[0];
        assert_eq!(answer.ttl(), LOOPBACK_TTL);
        assert_eq!(
            answer.data(),
            Some(&RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)))
        );
    }

    #[test]
    fn off_policy_query_is_forwarded() {
        let request = query("otherdomain.net.", RecordType::A);
        assert!(classify(&policy(), &request).is_none());
    }

    #[test]
    fn non_address_query_is_forwarded() {
        let request = query("www.example.com.", RecordType::TXT);
        assert!(classify(&policy(), &request).is_none());
    }

    /// Multi-question messages are refused with FORMERR instead of
    /// taking the process down.
    #[test]
    fn multi_question_query_gets_formerr() {
        let mut request = query("www.example.com.", RecordType::A);
        request.add_query(Query::query(
            Name::from_str("other.example.com.").unwrap(),
            RecordType::A,
        ));

        let reply = classify(&policy(), &request).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::FormErr);
        assert_eq!(reply.id(), 4242);
        assert!(reply.answers().is_empty());
    }

    #[test]
    fn reply_survives_the_wire() {
        let request = query("www.example.com.", RecordType::A);
        let reply = classify(&policy(), &request).unwrap();
        let bytes = reply.to_vec().unwrap();
        let decoded = Message::from_vec(&bytes).unwrap();
        assert_eq!(decoded.id(), 4242);
        assert_eq!(decoded.answers().len(), 1);
    }

    /// End to end over a real socket: the responder answers an in-policy
    /// query without touching any upstream.
    #[tokio::test]
    async fn responder_answers_over_udp() {
        let dead_upstream: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let responder = DnsResponder::bind(
            "127.0.0.1:0".parse().unwrap(),
            dead_upstream,
            Arc::new(policy()),
        )
        .await
        .unwrap();
        let addr = responder.local_addr().unwrap();
        tokio::spawn(responder.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = query("www.example.com.", RecordType::A).to_vec().unwrap();
        client.send_to(&request, addr).await.unwrap();

        let mut buf = [0u8; DNS_BUF_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Message::from_vec(&buf[..len]).unwrap();
        assert!(reply.authoritative());
        assert_eq!(
            reply.answers()[0].data(),
            Some(&RData::A(A(Ipv4Addr::LOCALHOST)))
        );
    }
}
