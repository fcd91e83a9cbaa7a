// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::model::InvocationId;
use forge_api_grpc::proto::forge::common;
use tonic::Status;

pub fn proto_invocation_id_string(id: &Option<common::InvocationId>) -> Option<String> {
    id.clone()
        .and_then(|v| TryInto::<InvocationId>::try_into(v).ok())
        .map(|v| v.to_string())
}

/// Validates the invocation id carried by an inbound request against the
/// local build's identity. A peer from a different build is refused.
pub fn require_invocation_id(
    actual: &Option<common::InvocationId>,
    expected: &InvocationId,
) -> Result<(), Status> {
    let actual: InvocationId = actual
        .clone()
        .ok_or_else(|| Status::invalid_argument("Missing invocation id"))?
        .try_into()
        .map_err(|err: String| Status::invalid_argument(err))?;

    if &actual == expected {
        Ok(())
    } else {
        Err(Status::failed_precondition(format!(
            "Invocation id mismatch: got {actual}, expected {expected}"
        )))
    }
}

pub fn error_body(error: impl Into<String>) -> common::ErrorBody {
    common::ErrorBody {
        error: error.into(),
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use uuid::Uuid;

    #[test]
    fn mismatched_invocation_id_is_refused() {
        let local = InvocationId::new(Uuid::new_v4(), "prod", "1.0.0");
        let remote = InvocationId::new(local.session_id, "prod", "1.0.1");

        assert!(require_invocation_id(&Some(local.clone().into()), &local).is_ok());

        let status = require_invocation_id(&Some(remote.into()), &local).unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status = require_invocation_id(&None, &local).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
