/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of rexec-gate
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Readiness probe: a bounded-retry TCP dial to the listen address, used to
//! confirm the listener is actually accepting connections after `Init()`
//! returns.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

pub async fn wait_until_ready(addr: SocketAddr, attempts: usize, delay: Duration) -> bool {
    for attempt in 0..attempts {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        if attempt + 1 < attempts {
            sleep(delay).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn ready_once_listener_is_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        assert!(wait_until_ready(addr, 5, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn not_ready_when_nothing_listens() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(!wait_until_ready(addr, 2, Duration::from_millis(10)).await);
    }
}
