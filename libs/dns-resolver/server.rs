use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use tokio::net::UdpSocket;

use crate::DnsHandler;

/// A UDP DNS server exposing a resolver chain on a local address, for
/// processes that resolve past the TUN hijacker.
pub struct Server {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn DnsHandler>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn DnsHandler>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        tracing::debug!(%addr, "Listening for UDP DNS queries");

        Ok(Self { socket, handler })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        let mut buf = vec![0u8; 2000];

        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;

            let query = match Message::from_vec(&buf[..len]) {
                Ok(query) => query,
                Err(e) => {
                    tracing::debug!(%from, "Failed to parse DNS query: {e}");
                    continue;
                }
            };

            let socket = self.socket.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let response = match handler.lookup(&query).await {
                    Ok(mut response) => {
                        response.set_id(query.id());
                        response
                    }
                    Err(e) => {
                        tracing::warn!(%from, "Lookup failed: {e}");
                        server_failure(&query)
                    }
                };

                match response.to_vec() {
                    Ok(payload) => {
                        if let Err(e) = socket.send_to(&payload, from).await {
                            tracing::debug!(%from, "Failed to send DNS response: {e}");
                        }
                    }
                    Err(e) => tracing::warn!(%from, "Failed to encode DNS response: {e}"),
                }
            });
        }
    }
}

fn server_failure(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_response_code(ResponseCode::ServFail);

    for question in query.queries() {
        response.add_query(question.clone());
    }

    response
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr as _;

    use async_trait::async_trait;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    use super::*;
    use crate::ResolveError;

    struct FixedAnswer;

    #[async_trait]
    impl DnsHandler for FixedAnswer {
        async fn lookup(&self, query: &Message) -> Result<Message, ResolveError> {
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            for q in query.queries() {
                response.add_query(q.clone());
                response.add_answer(Record::from_rdata(
                    q.name().clone(),
                    30,
                    RData::A(Ipv4Addr::new(192, 0, 2, 9).into()),
                ));
            }

            Ok(response)
        }

        fn name(&self) -> String {
            "FIXED".to_owned()
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl DnsHandler for AlwaysFails {
        async fn lookup(&self, _: &Message) -> Result<Message, ResolveError> {
            Err(ResolveError::Upstream("down".to_owned()))
        }

        fn name(&self) -> String {
            "FAILS".to_owned()
        }
    }

    async fn ask(server_addr: SocketAddr) -> Message {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut query = Message::new();
        query.set_id(99);
        query.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));

        socket
            .send_to(&query.to_vec().unwrap(), server_addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; 2000];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();

        Message::from_vec(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn serves_answers_from_the_handler() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(FixedAnswer))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let response = ask(addr).await;

        assert_eq!(response.id(), 99);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn handler_errors_become_servfail() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(AlwaysFails))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let response = ask(addr).await;

        assert_eq!(response.id(), 99);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }
}
